use crate::{env_or_default, env_parse, ConfigError, FromEnv};

/// Connection settings for the shared coordination store.
///
/// `REDIS_URL` wins when set; otherwise the URL is assembled from
/// `REDIS_HOST`, `REDIS_PORT`, `REDIS_DB` and `REDIS_PASSWORD`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: u8,
    pub password: Option<String>,
    url_override: Option<String>,
}

impl RedisConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            db: 0,
            password: None,
            url_override: None,
        }
    }

    /// Use a pre-formatted connection URL verbatim.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url_override: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_db(mut self, db: u8) -> Self {
        self.db = db;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Connection URL in the `redis://[:password@]host:port/db` form.
    pub fn url(&self) -> String {
        if let Some(url) = &self.url_override {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// URL safe to log (password masked).
    pub fn redacted_url(&self) -> String {
        match (&self.url_override, &self.password) {
            (Some(_), _) => "redis://<configured-url>".to_string(),
            (None, Some(_)) => format!("redis://:***@{}:{}/{}", self.host, self.port, self.db),
            (None, None) => self.url(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("localhost", 6379)
    }
}

impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("REDIS_URL") {
            return Ok(Self::from_url(url));
        }

        let mut config = Self::new(
            env_or_default("REDIS_HOST", "localhost"),
            env_parse("REDIS_PORT", 6379u16)?,
        )
        .with_db(env_parse("REDIS_DB", 0u8)?);

        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            if !password.is_empty() {
                config = config.with_password(password);
            }
        }

        Ok(config)
    }
}
