//! Startup configuration, read from flags or the process environment.

use clap::Args;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Instruction sent as the system message of every chat completion.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are PythOwO, a code generator that ONLY writes code in PythOwO language.
PythOwO syntax rules:
- Variables: pwease x = 10
- Print: pwint("hello")
- If: IF condition THWEN expression
- Elif: EWIF condition THWEN expression
- Else: EWSE expression
- For loop: FOR i = 0 TO 5 THWEN ... END
- Functions: FWUNCTION name(params) -> expression
- Return: WETURN value

Example:
pwease a = 10
pwease b = 20
pwease sum = a + b
pwint(sum)

RULES:
- Output ONLY raw PythOwO code. No markdown, no backticks, no explanations.
- Every variable must use pwease
- Every print must use pwint
- Never write regular Python"#;

/// Everything the server needs, built once in `main` and passed down.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "9000")]
    pub port: u16,

    /// Directory with the front-end bundle, served at `/`
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    #[command(flatten)]
    pub inference: InferenceConfig,

    #[command(flatten)]
    pub executor: ExecutorConfig,

    #[command(flatten)]
    pub share: ShareConfig,
}

/// Upstream chat-completion provider settings.
#[derive(Args, Debug, Clone)]
pub struct InferenceConfig {
    /// API token for the inference provider
    #[arg(long, env = "HUGGINGFACE_API_KEY", hide_env_values = true, default_value = "")]
    pub api_key: String,

    /// OpenAI-compatible chat completions endpoint
    #[arg(
        long,
        env = "INFERENCE_URL",
        default_value = "https://router.huggingface.co/v1/chat/completions"
    )]
    pub url: String,

    #[arg(long, env = "INFERENCE_MODEL", default_value = "Qwen/Qwen2.5-72B-Instruct")]
    pub model: String,

    #[arg(long, env = "TEMPERATURE", default_value = "0.3")]
    pub temperature: f64,

    #[arg(long, env = "MAX_TOKENS", default_value = "2048")]
    pub max_tokens: u32,

    /// Nucleus sampling; `none` leaves it out of the request
    #[arg(long, env = "TOP_P", default_value = "0.9")]
    pub top_p: TopP,

    /// Target language used when a chat request carries no hint
    #[arg(long, env = "CHAT_LANGUAGE", default_value = "PythOwO")]
    pub language: String,

    #[arg(long, env = "SYSTEM_PROMPT", default_value = DEFAULT_SYSTEM_PROMPT, hide_default_value = true)]
    pub system_prompt: String,
}

/// `top_p` value that can be switched off from the command line or env.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopP(pub Option<f64>);

impl FromStr for TopP {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(TopP(None));
        }
        let value: f64 = s.parse().map_err(|_| format!("invalid top_p: {:?}", s))?;
        if !(0.0..=1.0).contains(&value) {
            return Err(format!("top_p must be within 0..=1, got {}", value));
        }
        Ok(TopP(Some(value)))
    }
}

/// Limits and command line for sandboxed runs.
#[derive(Args, Debug, Clone)]
pub struct ExecutorConfig {
    /// Interpreter binary
    #[arg(long, env = "INTERPRETER", default_value = "python")]
    pub interpreter: String,

    /// Arguments placed before the scratch file path
    #[arg(long, env = "INTERPRETER_ARGS", value_delimiter = ',', default_value = "pythowo.py")]
    pub interpreter_args: Vec<String>,

    /// Directory holding scratch files, created on demand
    #[arg(long, env = "SCRATCH_DIR", default_value = "tmp")]
    pub scratch_dir: PathBuf,

    #[arg(long, env = "SCRATCH_EXT", default_value = "pyowo")]
    pub scratch_ext: String,

    /// Wall-clock budget per run in milliseconds
    #[arg(long, env = "RUN_TIMEOUT_MS", default_value = "10000")]
    pub timeout_ms: u64,

    /// Stdout bytes allowed before the child is killed
    #[arg(long, env = "RUN_OUTPUT_LIMIT", default_value = "100000")]
    pub output_limit: usize,
}

/// Where shared snippets land and how they are addressed.
#[derive(Args, Debug, Clone)]
pub struct ShareConfig {
    #[arg(long, env = "SHARE_DIR", default_value = "share")]
    pub share_dir: PathBuf,

    /// Path prefix the returned locator starts with
    #[arg(long, env = "SHARE_URL_PREFIX", default_value = "/share")]
    pub url_prefix: String,

    #[arg(long, env = "SHARE_EXT", default_value = "txt")]
    pub extension: String,
}

impl ShareConfig {
    /// Router path under which published snippets are served.
    ///
    /// Taken from the path part of `url_prefix` so locators resolve against
    /// this server. `None` when that path is empty (`/` or a bare origin).
    pub fn route_prefix(&self) -> Option<String> {
        let prefix = self.url_prefix.as_str();
        let path = match prefix.split_once("://") {
            Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or(""),
            None => prefix,
        };
        let path = path.trim_matches('/');
        if path.is_empty() {
            None
        } else {
            Some(format!("/{}", path))
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Make relative interpreter arguments that name existing files absolute.
    ///
    /// The child runs with the scratch directory as its working directory, so
    /// a script path like `pythowo.py` would otherwise stop resolving.
    pub fn resolve_interpreter_args(&mut self) {
        for arg in &mut self.interpreter_args {
            let path = PathBuf::from(arg.as_str());
            if path.is_relative() && path.is_file() {
                if let Ok(absolute) = path.canonicalize() {
                    *arg = absolute.to_string_lossy().into_owned();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults_match_stock_deployment() {
        let cli = TestCli::try_parse_from(["forge-relay"]).unwrap();
        let config = cli.config;
        assert_eq!(config.inference.model, "Qwen/Qwen2.5-72B-Instruct");
        assert_eq!(config.inference.top_p, TopP(Some(0.9)));
        assert_eq!(config.inference.max_tokens, 2048);
        assert_eq!(config.executor.interpreter_args, vec!["pythowo.py".to_string()]);
        assert_eq!(config.executor.timeout(), Duration::from_secs(10));
        assert_eq!(config.share.url_prefix, "/share");
        assert!(config.inference.system_prompt.starts_with("You are PythOwO"));
    }

    #[test]
    fn interpreter_args_split_on_commas() {
        let cli = TestCli::try_parse_from([
            "forge-relay",
            "--interpreter",
            "python3",
            "--interpreter-args=-u,runner.py",
        ])
        .unwrap();
        assert_eq!(cli.config.executor.interpreter, "python3");
        assert_eq!(cli.config.executor.interpreter_args, vec!["-u", "runner.py"]);
    }

    #[test]
    fn top_p_can_be_switched_off() {
        let cli = TestCli::try_parse_from(["forge-relay", "--top-p", "none"]).unwrap();
        assert_eq!(cli.config.inference.top_p, TopP(None));

        let cli = TestCli::try_parse_from(["forge-relay", "--top-p="]).unwrap();
        assert_eq!(cli.config.inference.top_p, TopP(None));

        let cli = TestCli::try_parse_from(["forge-relay", "--top-p", "0.5"]).unwrap();
        assert_eq!(cli.config.inference.top_p, TopP(Some(0.5)));

        assert!(TestCli::try_parse_from(["forge-relay", "--top-p", "1.5"]).is_err());
        assert!(TestCli::try_parse_from(["forge-relay", "--top-p", "lots"]).is_err());
    }

    #[test]
    fn route_prefix_takes_the_locator_path() {
        let share = |prefix: &str| ShareConfig {
            share_dir: PathBuf::from("share"),
            url_prefix: prefix.into(),
            extension: "txt".into(),
        };
        assert_eq!(share("/share").route_prefix().as_deref(), Some("/share"));
        assert_eq!(share("/share/").route_prefix().as_deref(), Some("/share"));
        assert_eq!(share("snippets").route_prefix().as_deref(), Some("/snippets"));
        assert_eq!(
            share("https://forge.example/s/").route_prefix().as_deref(),
            Some("/s")
        );
        assert_eq!(share("/").route_prefix(), None);
        assert_eq!(share("").route_prefix(), None);
        assert_eq!(share("https://forge.example").route_prefix(), None);
        assert_eq!(share("https://forge.example/").route_prefix(), None);
    }

    #[test]
    fn resolve_keeps_flags_and_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("runner.py");
        std::fs::write(&script, "").unwrap();
        let mut config = ExecutorConfig {
            interpreter: "python".into(),
            interpreter_args: vec![
                "-u".into(),
                "does-not-exist.py".into(),
                script.to_string_lossy().into_owned(),
            ],
            scratch_dir: dir.path().to_path_buf(),
            scratch_ext: "py".into(),
            timeout_ms: 1000,
            output_limit: 10,
        };
        config.resolve_interpreter_args();
        assert_eq!(config.interpreter_args[0], "-u");
        assert_eq!(config.interpreter_args[1], "does-not-exist.py");
        assert_eq!(config.interpreter_args[2], script.to_string_lossy());
    }
}
