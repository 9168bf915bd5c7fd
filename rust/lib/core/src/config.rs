use std::path::PathBuf;

/// Runtime configuration of the record engine.
///
/// Embedding binaries parse these from command-line arguments, then pass
/// them to the registry builder and to storage initialization.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the SQLite database file.
    /// `None` opens a private in-memory database.
    pub sqlite_path: Option<PathBuf>,

    /// User id that bypasses method permissions and record rules.
    pub superuser_id: i64,

    /// Language used when the environment context carries no `lang`.
    pub default_lang: String,

    /// Result cap for name searches when the caller passes no limit.
    pub default_limit: usize,

    /// Emit every SQL statement at debug level.
    pub log_sql: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            superuser_id: 1,
            default_lang: "en_US".to_string(),
            default_limit: 80,
            log_sql: false,
        }
    }
}

impl RuntimeConfig {
    /// Parse configuration from command-line arguments.
    ///
    /// Supported flags:
    /// - `--sqlite=PATH`
    /// - `--superuser=ID`
    /// - `--lang=CODE`
    /// - `--default-limit=N`
    /// - `--log-sql`
    ///
    /// Unparseable numbers keep the default.
    pub fn from_args(args: &[String]) -> Self {
        let mut config = RuntimeConfig::default();

        for arg in args {
            if let Some(val) = arg.strip_prefix("--sqlite=") {
                config.sqlite_path = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--superuser=") {
                if let Ok(id) = val.parse() {
                    config.superuser_id = id;
                }
            } else if let Some(val) = arg.strip_prefix("--lang=") {
                config.default_lang = val.to_string();
            } else if let Some(val) = arg.strip_prefix("--default-limit=") {
                if let Ok(n) = val.parse() {
                    config.default_limit = n;
                }
            } else if arg == "--log-sql" {
                config.log_sql = true;
            }
        }

        config
    }

    /// Language for a context value, falling back to `default_lang`.
    pub fn resolve_lang<'a>(&'a self, lang: Option<&'a str>) -> &'a str {
        match lang {
            Some(l) if !l.is_empty() => l,
            _ => &self.default_lang,
        }
    }
}
