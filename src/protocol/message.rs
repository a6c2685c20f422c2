//! Protocol message types

use super::constants::tx_status;
use bytes::Bytes;

/// Frontend message (client → server)
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Startup message (no tag byte)
    Startup {
        /// Protocol version
        version: i32,
        /// Connection parameters
        params: Vec<(String, String)>,
    },

    /// Password message (cleartext or md5-hashed response)
    Password(String),

    /// Simple query
    Query(String),

    /// Parse a statement under a server-side name
    Parse {
        /// Prepared statement name ("" = unnamed)
        name: String,
        /// Statement text with `$n` placeholders
        statement: String,
    },

    /// Bind parameters to a parsed statement
    Bind {
        /// Portal name ("" = unnamed)
        portal: String,
        /// Prepared statement name
        statement: String,
        /// Encoded parameter values (None = SQL NULL)
        params: Vec<BoundValue>,
    },

    /// Describe a prepared statement
    Describe {
        /// Prepared statement name
        statement: String,
    },

    /// Execute a bound portal
    Execute {
        /// Portal name
        portal: String,
    },

    /// Sync (ends an extended-protocol request group)
    Sync,

    /// Terminate
    Terminate,

    /// SASL initial response message
    SaslInitialResponse {
        /// SASL mechanism name (e.g., "SCRAM-SHA-256")
        mechanism: String,
        /// SASL client first message data
        data: Vec<u8>,
    },

    /// SASL response message
    SaslResponse {
        /// SASL client final message data
        data: Vec<u8>,
    },

    /// SSLRequest message (TLS negotiation)
    SslRequest,
}

/// An encoded parameter value carried by Bind
#[derive(Debug, Clone)]
pub struct BoundValue {
    /// Wire format: 0 = text, 1 = binary
    pub format: i16,
    /// Encoded bytes; None binds SQL NULL
    pub bytes: Option<Bytes>,
}

impl BoundValue {
    /// Binary-format value
    pub fn binary(bytes: Bytes) -> Self {
        Self {
            format: 1,
            bytes: Some(bytes),
        }
    }

    /// SQL NULL (format code is irrelevant on the wire but sent as binary)
    pub fn null() -> Self {
        Self {
            format: 1,
            bytes: None,
        }
    }
}

/// Backend message (server → client)
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationRequest),

    /// Backend key data (process id + secret for cancellation)
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Bind complete
    BindComplete,

    /// Command complete with its tag ("INSERT 0 1", "SELECT 5", ...)
    CommandComplete(String),

    /// Data row; each column is raw bytes or NULL
    DataRow(Vec<Option<Bytes>>),

    /// Empty query response
    EmptyQueryResponse,

    /// Error response
    ErrorResponse(ErrorFields),

    /// No data (statement produces no rows)
    NoData,

    /// Notice response
    NoticeResponse(ErrorFields),

    /// Asynchronous notification (LISTEN/NOTIFY)
    NotificationResponse(Notification),

    /// Parameter description (type OIDs of statement placeholders)
    ParameterDescription(Vec<u32>),

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Parse complete
    ParseComplete,

    /// Ready for query
    ReadyForQuery(TransactionStatus),

    /// Row description
    RowDescription(Vec<FieldDescription>),

    /// A message with a tag this client does not interpret.
    /// Carried through so callers may log and skip it.
    Unknown {
        /// Raw tag byte
        tag: u8,
        /// Raw body bytes
        body: Bytes,
    },
}

/// Authentication request kinds
#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationRequest {
    /// Authentication OK
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for the MD5 hash
        salt: [u8; 4],
    },

    /// SASL authentication mechanisms available (Postgres 10+)
    Sasl {
        /// Mechanism names (e.g., ["SCRAM-SHA-256"])
        mechanisms: Vec<String>,
    },

    /// SASL continuation (server challenge)
    SaslContinue {
        /// Server first/continue message data
        data: Vec<u8>,
    },

    /// SASL final (server verification)
    SaslFinal {
        /// Server final message data
        data: Vec<u8>,
    },
}

/// Transaction status reported by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Map the ReadyForQuery status byte; unknown bytes read as Idle.
    pub fn from_byte(b: u8) -> Self {
        match b {
            tx_status::IN_TRANSACTION => TransactionStatus::InTransaction,
            tx_status::FAILED => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

/// Field description (column metadata)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: u32,
    /// Column attribute number (0 if not a table column)
    pub column_attr: i16,
    /// Data type OID
    pub type_oid: u32,
    /// Data type size
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Format code (0 = text, 1 = binary)
    pub format_code: i16,
}

/// Asynchronous notification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Backend process that issued NOTIFY
    pub process_id: i32,
    /// Channel name
    pub channel: String,
    /// Payload string (may be empty)
    pub payload: String,
}

/// Error/notice fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity (ERROR, FATAL, WARNING, ...)
    pub severity: Option<String>,
    /// SQLSTATE code
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// Additional detail
    pub detail: Option<String>,
    /// Hint
    pub hint: Option<String>,
    /// Position in query string
    pub position: Option<String>,
}

impl ErrorFields {
    /// FATAL and PANIC severities terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_deref(), Some("FATAL") | Some("PANIC"))
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref sev) = self.severity {
            write!(f, "{}: ", sev)?;
        }
        if let Some(ref msg) = self.message {
            write!(f, "{}", msg)?;
        }
        if let Some(ref code) = self.code {
            write!(f, " ({})", code)?;
        }
        if let Some(ref detail) = self.detail {
            write!(f, "; {}", detail)?;
        }
        Ok(())
    }
}

/// Extract the affected-row count from a CommandComplete tag.
///
/// INSERT tags carry an extra OID field ("INSERT 0 5"); the count is always
/// the final token. Tags without a count ("BEGIN", "LISTEN") report zero.
pub fn affected_rows(tag: &str) -> u64 {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n] | ["UPDATE", n] | ["DELETE", n] | ["SELECT", n] | ["COPY", n]
        | ["MOVE", n] | ["FETCH", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}
