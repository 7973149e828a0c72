/// Persisted login session (single row)
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: Option<i64>,
    pub updated_at: i64,
}
