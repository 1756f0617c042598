//! SQL for the jobs and messages tables.
//!
//! Timestamps are epoch milliseconds so staleness checks compare integers.

pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY NOT NULL,
    conversation_id INTEGER NOT NULL,
    message_id INTEGER,
    type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    content TEXT NOT NULL DEFAULT '',
    thinking TEXT NOT NULL DEFAULT '',
    sources TEXT,
    model TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    thinking TEXT NOT NULL DEFAULT '',
    sources TEXT,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_JOBS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_updated ON jobs(status, updated_at)";

pub const CREATE_JOBS_CONVERSATION_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_conversation ON jobs(conversation_id)";

/// Statements run by `JobStore::migrate`, in order
pub const MIGRATIONS: &[&str] = &[
    CREATE_JOBS_TABLE,
    CREATE_MESSAGES_TABLE,
    CREATE_JOBS_STATUS_INDEX,
    CREATE_JOBS_CONVERSATION_INDEX,
];

pub const SELECT_JOB_COLUMNS: &str = "SELECT id, conversation_id, message_id, type, status, \
     content, thinking, sources, model, priority, error_message, created_at, updated_at FROM jobs";
