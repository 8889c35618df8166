//! Editing session keys.
//!
//! A key identifies one in-progress co-editing session of a file with an
//! external editor. Layout:
//!
//! ```text
//! YYYYMMDDHHMMSS <company:22> <user:22> <application> = <instance>
//! ```
//!
//! The UTC timestamp prefix keeps keys sortable by creation time. UUIDs and
//! ids are base64url without padding, so `=` only ever appears as the
//! separator between the application and instance ids.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, NaiveDateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;
use uuid::Uuid;

pub const MAX_KEY_LEN: usize = 128;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const TIMESTAMP_LEN: usize = 14;
const UUID_LEN: usize = 22;
const HEADER_LEN: usize = TIMESTAMP_LEN + 2 * UUID_LEN;

#[derive(Error, Diagnostic, Debug, PartialEq, Eq)]
pub enum EditingSessionError {
    #[error("Editing session key is {len} characters long, the limit is {max}", max = MAX_KEY_LEN)]
    #[diagnostic(
        code(drive::editing_session::key_too_long),
        help("Use shorter application or instance ids")
    )]
    KeyTooLong { len: usize },

    #[error("Malformed editing session key: {reason}")]
    #[diagnostic(code(drive::editing_session::malformed))]
    Malformed { reason: String },
}

pub type EditingSessionResult<T> = Result<T, EditingSessionError>;

/// Decoded content of an editing session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditingSession {
    pub application_id: String,
    pub instance_id: String,
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl EditingSession {
    pub fn new(
        application_id: impl Into<String>,
        instance_id: impl Into<String>,
        company_id: Uuid,
        user_id: Uuid,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            instance_id: instance_id.into(),
            company_id,
            user_id,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> EditingSessionResult<String> {
        generate(
            &self.application_id,
            &self.instance_id,
            self.company_id,
            self.user_id,
            self.timestamp,
        )
    }
}

/// Build the key of a session started at `timestamp`.
pub fn generate(
    application_id: &str,
    instance_id: &str,
    company_id: Uuid,
    user_id: Uuid,
    timestamp: DateTime<Utc>,
) -> EditingSessionResult<String> {
    let key = format!(
        "{}{}{}{}={}",
        timestamp.format(TIMESTAMP_FORMAT),
        URL_SAFE_NO_PAD.encode(company_id.as_bytes()),
        URL_SAFE_NO_PAD.encode(user_id.as_bytes()),
        URL_SAFE_NO_PAD.encode(application_id),
        URL_SAFE_NO_PAD.encode(instance_id),
    );
    if key.len() > MAX_KEY_LEN {
        return Err(EditingSessionError::KeyTooLong { len: key.len() });
    }
    Ok(key)
}

/// Whether `key` only uses the characters and length a key may have.
pub fn is_well_formed(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'))
}

fn malformed(reason: impl Into<String>) -> EditingSessionError {
    EditingSessionError::Malformed {
        reason: reason.into(),
    }
}

fn decode_uuid(part: &str, what: &str) -> EditingSessionResult<Uuid> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| malformed(format!("{what}: {e}")))?;
    Uuid::from_slice(&bytes).map_err(|e| malformed(format!("{what}: {e}")))
}

fn decode_text(part: &str, what: &str) -> EditingSessionResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| malformed(format!("{what}: {e}")))?;
    String::from_utf8(bytes).map_err(|e| malformed(format!("{what}: {e}")))
}

/// Decode a key built by [`generate`].
pub fn parse(key: &str) -> EditingSessionResult<EditingSession> {
    if key.len() > MAX_KEY_LEN {
        return Err(EditingSessionError::KeyTooLong { len: key.len() });
    }
    if !is_well_formed(key) {
        return Err(malformed("unexpected characters"));
    }
    if key.len() < HEADER_LEN + 1 {
        return Err(malformed("key is too short"));
    }

    let (stamp, rest) = key.split_at(TIMESTAMP_LEN);
    let (company, rest) = rest.split_at(UUID_LEN);
    let (user, ids) = rest.split_at(UUID_LEN);
    let Some((application, instance)) = ids.split_once('=') else {
        return Err(malformed("missing '=' between application and instance"));
    };

    let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .map_err(|e| malformed(format!("timestamp: {e}")))?
        .and_utc();

    Ok(EditingSession {
        application_id: decode_text(application, "application id")?,
        instance_id: decode_text(instance, "instance id")?,
        company_id: decode_uuid(company, "company id")?,
        user_id: decode_uuid(user, "user id")?,
        timestamp,
    })
}
