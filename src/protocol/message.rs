//! Archive Messages
//!
//! Typed request and reply messages exchanged between clients, the monitor
//! and replica servers, wrapped in an [`Envelope`] that carries correlation
//! and reply addressing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::BatchJob;

/// Message identifier, also used as correlation id
pub type MessageId = Uuid;

/// Named message destinations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Topic: every subscribed replica server receives a copy
    AllReplicas,
    /// Queue: exactly one subscribed replica server receives the message
    AnyReplica,
    /// The monitor (batch coordinator and reconciliation engine)
    Monitor,
    /// One specific replica server
    Replica(String),
    /// A named client awaiting replies
    Client(String),
}

impl Destination {
    /// Whether every subscriber receives a copy
    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::AllReplicas)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::AllReplicas => write!(f, "ALL_REPLICAS"),
            Destination::AnyReplica => write!(f, "ANY_REPLICA"),
            Destination::Monitor => write!(f, "MONITOR"),
            Destination::Replica(id) => write!(f, "REPLICA_{}", id),
            Destination::Client(name) => write!(f, "CLIENT_{}", name),
        }
    }
}

/// Addressing information of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Unique id of this message
    pub id: MessageId,
    /// Id of the request this message answers
    pub in_reply_to: Option<MessageId>,
    /// Where replies to this message go
    pub reply_to: Option<Destination>,
    /// Sender name, for logging
    pub sender: String,
}

/// A message with its addressing information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub body: Message,
}

impl Envelope {
    /// New request with a fresh id
    pub fn new(sender: impl Into<String>, body: Message) -> Self {
        Self {
            header: Header {
                id: Uuid::new_v4(),
                in_reply_to: None,
                reply_to: None,
                sender: sender.into(),
            },
            body,
        }
    }

    /// Set where replies should be sent
    pub fn reply_to(mut self, destination: Destination) -> Self {
        self.header.reply_to = Some(destination);
        self
    }

    /// New reply to the message with `request` header
    pub fn reply(sender: impl Into<String>, request: &Header, body: Message) -> Self {
        Self {
            header: Header {
                id: Uuid::new_v4(),
                in_reply_to: Some(request.id),
                reply_to: None,
                sender: sender.into(),
            },
            body,
        }
    }

    pub fn id(&self) -> MessageId {
        self.header.id
    }

    /// Serialize envelope to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize envelope from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Run a batch job on all live replicas (or one replica)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub job: BatchJob,
    /// Restrict the fan-out to one replica; `None` means all live replicas
    pub replica_id: Option<String>,
}

/// A replica finished its part of a batch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEnded {
    pub replica_id: String,
    pub files_processed: u64,
    pub files_failed: Vec<String>,
    pub result: Vec<u8>,
    pub error: Option<String>,
}

impl BatchEnded {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated result of a batch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReply {
    pub files_processed: u64,
    pub files_failed: Vec<String>,
    pub result: Vec<u8>,
    pub ok: bool,
    pub error: Option<String>,
}

/// Replica sign of life
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub replica_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Fetch (part of) a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub filename: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub ok: bool,
    pub replica_id: String,
    pub record: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// Store a new file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReply {
    pub ok: bool,
    pub replica_id: String,
    pub error: Option<String>,
}

/// Quarantine a file on one replica and return its content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveAndGetRequest {
    pub filename: String,
    pub replica_id: String,
    pub expected_checksum: String,
    pub credentials: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveAndGetReply {
    pub ok: bool,
    pub replica_id: String,
    pub content: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// Replace a corrupt copy on one replica with correct content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub filename: String,
    pub replica_id: String,
    pub incorrect_checksum: String,
    pub correct_content: Vec<u8>,
    pub credentials: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionReply {
    pub ok: bool,
    /// The quarantined copy, once removal succeeded
    pub removed_file: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// Cancel a running batch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTermination {
    pub job_id: MessageId,
}

/// All checksums of one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAllChecksumsRequest {
    pub replica_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAllChecksumsReply {
    pub ok: bool,
    pub checksums: Vec<u8>,
    pub error: Option<String>,
}

/// All filenames of one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAllFilenamesRequest {
    pub replica_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAllFilenamesReply {
    pub ok: bool,
    pub filenames: Vec<String>,
    pub error: Option<String>,
}

/// Checksum of one file on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChecksumRequest {
    pub filename: String,
    pub replica_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChecksumReply {
    pub ok: bool,
    pub checksum: Option<String>,
    pub error: Option<String>,
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Batch jobs ==========
    Batch(BatchRequest),
    BatchEnded(BatchEnded),
    BatchReply(BatchReply),
    BatchTermination(BatchTermination),

    // ========== Liveness ==========
    Heartbeat(Heartbeat),

    // ========== File access ==========
    Get(GetRequest),
    GetReply(GetReply),
    Upload(UploadRequest),
    UploadReply(UploadReply),
    RemoveAndGet(RemoveAndGetRequest),
    RemoveAndGetReply(RemoveAndGetReply),

    // ========== Repair ==========
    Correct(CorrectionRequest),
    CorrectReply(CorrectionReply),

    // ========== Checksum queries ==========
    GetAllChecksums(GetAllChecksumsRequest),
    GetAllChecksumsReply(GetAllChecksumsReply),
    GetAllFilenames(GetAllFilenamesRequest),
    GetAllFilenamesReply(GetAllFilenamesReply),
    GetChecksum(GetChecksumRequest),
    GetChecksumReply(GetChecksumReply),
}

/// Message kind without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Batch,
    BatchEnded,
    BatchReply,
    BatchTermination,
    Heartbeat,
    Get,
    GetReply,
    Upload,
    UploadReply,
    RemoveAndGet,
    RemoveAndGetReply,
    Correct,
    CorrectReply,
    GetAllChecksums,
    GetAllChecksumsReply,
    GetAllFilenames,
    GetAllFilenamesReply,
    GetChecksum,
    GetChecksumReply,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Batch(_) => MessageKind::Batch,
            Message::BatchEnded(_) => MessageKind::BatchEnded,
            Message::BatchReply(_) => MessageKind::BatchReply,
            Message::BatchTermination(_) => MessageKind::BatchTermination,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::Get(_) => MessageKind::Get,
            Message::GetReply(_) => MessageKind::GetReply,
            Message::Upload(_) => MessageKind::Upload,
            Message::UploadReply(_) => MessageKind::UploadReply,
            Message::RemoveAndGet(_) => MessageKind::RemoveAndGet,
            Message::RemoveAndGetReply(_) => MessageKind::RemoveAndGetReply,
            Message::Correct(_) => MessageKind::Correct,
            Message::CorrectReply(_) => MessageKind::CorrectReply,
            Message::GetAllChecksums(_) => MessageKind::GetAllChecksums,
            Message::GetAllChecksumsReply(_) => MessageKind::GetAllChecksumsReply,
            Message::GetAllFilenames(_) => MessageKind::GetAllFilenames,
            Message::GetAllFilenamesReply(_) => MessageKind::GetAllFilenamesReply,
            Message::GetChecksum(_) => MessageKind::GetChecksum,
            Message::GetChecksumReply(_) => MessageKind::GetChecksumReply,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        self.kind().name()
    }
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Batch => "Batch",
            MessageKind::BatchEnded => "BatchEnded",
            MessageKind::BatchReply => "BatchReply",
            MessageKind::BatchTermination => "BatchTermination",
            MessageKind::Heartbeat => "Heartbeat",
            MessageKind::Get => "Get",
            MessageKind::GetReply => "GetReply",
            MessageKind::Upload => "Upload",
            MessageKind::UploadReply => "UploadReply",
            MessageKind::RemoveAndGet => "RemoveAndGet",
            MessageKind::RemoveAndGetReply => "RemoveAndGetReply",
            MessageKind::Correct => "Correct",
            MessageKind::CorrectReply => "CorrectReply",
            MessageKind::GetAllChecksums => "GetAllChecksums",
            MessageKind::GetAllChecksumsReply => "GetAllChecksumsReply",
            MessageKind::GetAllFilenames => "GetAllFilenames",
            MessageKind::GetAllFilenamesReply => "GetAllFilenamesReply",
            MessageKind::GetChecksum => "GetChecksum",
            MessageKind::GetChecksumReply => "GetChecksumReply",
        }
    }

    /// The not-ok reply sent when handling a request of this kind fails.
    ///
    /// `None` for kinds that are not answered (replies, heartbeats,
    /// batch-ended and termination messages).
    pub fn not_ok_reply(self, replica_id: &str, error: String) -> Option<Message> {
        let error = Some(error);
        let reply = match self {
            MessageKind::Batch => Message::BatchReply(BatchReply {
                files_processed: 0,
                files_failed: Vec::new(),
                result: Vec::new(),
                ok: false,
                error,
            }),
            MessageKind::Get => Message::GetReply(GetReply {
                ok: false,
                replica_id: replica_id.to_string(),
                record: None,
                error,
            }),
            MessageKind::Upload => Message::UploadReply(UploadReply {
                ok: false,
                replica_id: replica_id.to_string(),
                error,
            }),
            MessageKind::RemoveAndGet => Message::RemoveAndGetReply(RemoveAndGetReply {
                ok: false,
                replica_id: replica_id.to_string(),
                content: None,
                error,
            }),
            MessageKind::Correct => Message::CorrectReply(CorrectionReply {
                ok: false,
                removed_file: None,
                error,
            }),
            MessageKind::GetAllChecksums => Message::GetAllChecksumsReply(GetAllChecksumsReply {
                ok: false,
                checksums: Vec::new(),
                error,
            }),
            MessageKind::GetAllFilenames => Message::GetAllFilenamesReply(GetAllFilenamesReply {
                ok: false,
                filenames: Vec::new(),
                error,
            }),
            MessageKind::GetChecksum => Message::GetChecksumReply(GetChecksumReply {
                ok: false,
                checksum: None,
                error,
            }),
            _ => return None,
        };
        Some(reply)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope::new(
            "monitor",
            Message::Batch(BatchRequest {
                job: BatchJob::checksum(),
                replica_id: None,
            }),
        )
        .reply_to(Destination::Client("cli".into()));

        let bytes = envelope.serialize().unwrap();
        let restored = Envelope::deserialize(&bytes).unwrap();

        assert_eq!(restored.header, envelope.header);
        match restored.body {
            Message::Batch(request) => assert_eq!(request.job, BatchJob::checksum()),
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_reply_correlates_with_request() {
        let request = Envelope::new("client", Message::Get(GetRequest {
            filename: "a.warc".into(),
            offset: 0,
        }));
        let reply = Envelope::reply("ONE", &request.header, Message::UploadReply(UploadReply {
            ok: true,
            replica_id: "ONE".into(),
            error: None,
        }));
        assert_eq!(reply.header.in_reply_to, Some(request.id()));
        assert_ne!(reply.id(), request.id());
    }

    #[test]
    fn test_not_ok_reply_kinds() {
        let reply = MessageKind::Upload.not_ok_reply("ONE", "disk full".into()).unwrap();
        match reply {
            Message::UploadReply(r) => {
                assert!(!r.ok);
                assert_eq!(r.error.as_deref(), Some("disk full"));
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
        assert!(MessageKind::Heartbeat.not_ok_reply("ONE", "x".into()).is_none());
        assert!(MessageKind::BatchEnded.not_ok_reply("ONE", "x".into()).is_none());
    }
}
