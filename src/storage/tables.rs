use redb::TableDefinition;

/// Users: user_id -> User (msgpack)
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Secondary index: username -> user_id (active users only)
pub const USERNAMES: TableDefinition<&str, &str> = TableDefinition::new("usernames");

/// Training jobs: "{owner_id}/{fingerprint}" -> TrainingJob (msgpack).
/// The composite key is the (owner, fingerprint) uniqueness constraint.
pub const TRAINING_JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("training_jobs");

/// Secondary index: training job id -> composite key
pub const TRAINING_JOB_IDS: TableDefinition<&str, &str> = TableDefinition::new("training_job_ids");

/// Prediction jobs: "{owner_id}/{fingerprint}" -> PredictionJob (msgpack)
pub const PREDICTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("predictions");

/// Secondary index: prediction id -> composite key
pub const PREDICTION_IDS: TableDefinition<&str, &str> = TableDefinition::new("prediction_ids");

/// Token purchase ledger: "{owner_id}/{idempotency_key}" -> TokenCredit (msgpack)
pub const TOKEN_CREDITS: TableDefinition<&str, &[u8]> = TableDefinition::new("token_credits");

/// At most one pending purchase per owner: owner_id -> idempotency_key
pub const PENDING_CREDITS: TableDefinition<&str, &str> = TableDefinition::new("pending_credits");

/// Auth sessions: session_id -> AuthSession (msgpack)
pub const AUTH_SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("auth_sessions");

/// Secondary index: refresh-token hash -> session_id.
/// Holds both the current and the previous hash of every session so that a
/// replayed superseded token still resolves to its session.
pub const REFRESH_HASHES: TableDefinition<&str, &str> = TableDefinition::new("refresh_hashes");

/// Access tokens: token hash -> AccessToken (msgpack)
pub const ACCESS_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("access_tokens");
