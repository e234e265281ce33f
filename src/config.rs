//! Connection configuration.

/// Parameters for a single PostgreSQL connection.
///
/// Immutable once a connection attempt begins; owned by the
/// [`PgConnection`](crate::client::PgConnection) for its lifetime.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub password: String,
    pub database: String,

    /// Reported to the server as `application_name` if set.
    pub application_name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            database: "postgres".into(),
            application_name: None,
        }
    }
}

impl ConnectionConfig {
    /// Key/value pairs for the startup message.
    ///
    /// `client_encoding` is always UTF8; all row values are decoded as UTF-8
    /// text on that basis.
    pub fn startup_params(&self) -> Vec<(&str, &str)> {
        let mut params = vec![
            ("user", self.user.as_str()),
            ("database", self.database.as_str()),
            ("client_encoding", "UTF8"),
        ];
        if let Some(app) = self.application_name.as_deref() {
            params.push(("application_name", app));
        }
        params
    }
}
