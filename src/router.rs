//! Message Router
//!
//! Dispatches inbound envelopes to the typed handler method of their kind.
//! Handler errors never reach the receive loop: they are logged and turned
//! into a not-ok reply when the request has a reply destination.

use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::protocol::*;
use crate::transport::{Inbox, Transport};

fn unhandled(kind: MessageKind, handler: &'static str) -> Result<()> {
    Err(Error::UnhandledMessage {
        kind: kind.name(),
        handler,
    })
}

/// One method per message kind; kinds a handler does not override are
/// rejected with [`Error::UnhandledMessage`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handler name (for logging and error messages)
    fn name(&self) -> &'static str;

    /// Replica id used in not-ok replies
    fn replica_id(&self) -> &str {
        ""
    }

    async fn on_batch(&self, _header: &Header, _msg: BatchRequest) -> Result<()> {
        unhandled(MessageKind::Batch, self.name())
    }

    async fn on_batch_ended(&self, _header: &Header, _msg: BatchEnded) -> Result<()> {
        unhandled(MessageKind::BatchEnded, self.name())
    }

    async fn on_batch_reply(&self, _header: &Header, _msg: BatchReply) -> Result<()> {
        unhandled(MessageKind::BatchReply, self.name())
    }

    async fn on_batch_termination(&self, _header: &Header, _msg: BatchTermination) -> Result<()> {
        unhandled(MessageKind::BatchTermination, self.name())
    }

    async fn on_heartbeat(&self, _header: &Header, _msg: Heartbeat) -> Result<()> {
        unhandled(MessageKind::Heartbeat, self.name())
    }

    async fn on_get(&self, _header: &Header, _msg: GetRequest) -> Result<()> {
        unhandled(MessageKind::Get, self.name())
    }

    async fn on_get_reply(&self, _header: &Header, _msg: GetReply) -> Result<()> {
        unhandled(MessageKind::GetReply, self.name())
    }

    async fn on_upload(&self, _header: &Header, _msg: UploadRequest) -> Result<()> {
        unhandled(MessageKind::Upload, self.name())
    }

    async fn on_upload_reply(&self, _header: &Header, _msg: UploadReply) -> Result<()> {
        unhandled(MessageKind::UploadReply, self.name())
    }

    async fn on_remove_and_get(&self, _header: &Header, _msg: RemoveAndGetRequest) -> Result<()> {
        unhandled(MessageKind::RemoveAndGet, self.name())
    }

    async fn on_remove_and_get_reply(&self, _header: &Header, _msg: RemoveAndGetReply) -> Result<()> {
        unhandled(MessageKind::RemoveAndGetReply, self.name())
    }

    async fn on_correct(&self, _header: &Header, _msg: CorrectionRequest) -> Result<()> {
        unhandled(MessageKind::Correct, self.name())
    }

    async fn on_correct_reply(&self, _header: &Header, _msg: CorrectionReply) -> Result<()> {
        unhandled(MessageKind::CorrectReply, self.name())
    }

    async fn on_get_all_checksums(&self, _header: &Header, _msg: GetAllChecksumsRequest) -> Result<()> {
        unhandled(MessageKind::GetAllChecksums, self.name())
    }

    async fn on_get_all_checksums_reply(&self, _header: &Header, _msg: GetAllChecksumsReply) -> Result<()> {
        unhandled(MessageKind::GetAllChecksumsReply, self.name())
    }

    async fn on_get_all_filenames(&self, _header: &Header, _msg: GetAllFilenamesRequest) -> Result<()> {
        unhandled(MessageKind::GetAllFilenames, self.name())
    }

    async fn on_get_all_filenames_reply(&self, _header: &Header, _msg: GetAllFilenamesReply) -> Result<()> {
        unhandled(MessageKind::GetAllFilenamesReply, self.name())
    }

    async fn on_get_checksum(&self, _header: &Header, _msg: GetChecksumRequest) -> Result<()> {
        unhandled(MessageKind::GetChecksum, self.name())
    }

    async fn on_get_checksum_reply(&self, _header: &Header, _msg: GetChecksumReply) -> Result<()> {
        unhandled(MessageKind::GetChecksumReply, self.name())
    }
}

/// Routes envelopes from an inbox to a handler
pub struct MessageRouter<H: MessageHandler> {
    handler: Arc<H>,
    transport: Arc<dyn Transport>,
}

impl<H: MessageHandler> Clone for MessageRouter<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<H: MessageHandler> MessageRouter<H> {
    pub fn new(handler: Arc<H>, transport: Arc<dyn Transport>) -> Self {
        Self { handler, transport }
    }

    /// Dispatch one envelope to its handler method
    pub async fn dispatch(&self, envelope: Envelope) {
        let Envelope { header, body } = envelope;
        let kind = body.kind();
        let handler = self.handler.as_ref();

        tracing::trace!(
            "{} handling {} {} from {}",
            handler.name(),
            kind,
            header.id,
            header.sender
        );

        let result = match body {
            Message::Batch(m) => handler.on_batch(&header, m).await,
            Message::BatchEnded(m) => handler.on_batch_ended(&header, m).await,
            Message::BatchReply(m) => handler.on_batch_reply(&header, m).await,
            Message::BatchTermination(m) => handler.on_batch_termination(&header, m).await,
            Message::Heartbeat(m) => handler.on_heartbeat(&header, m).await,
            Message::Get(m) => handler.on_get(&header, m).await,
            Message::GetReply(m) => handler.on_get_reply(&header, m).await,
            Message::Upload(m) => handler.on_upload(&header, m).await,
            Message::UploadReply(m) => handler.on_upload_reply(&header, m).await,
            Message::RemoveAndGet(m) => handler.on_remove_and_get(&header, m).await,
            Message::RemoveAndGetReply(m) => handler.on_remove_and_get_reply(&header, m).await,
            Message::Correct(m) => handler.on_correct(&header, m).await,
            Message::CorrectReply(m) => handler.on_correct_reply(&header, m).await,
            Message::GetAllChecksums(m) => handler.on_get_all_checksums(&header, m).await,
            Message::GetAllChecksumsReply(m) => handler.on_get_all_checksums_reply(&header, m).await,
            Message::GetAllFilenames(m) => handler.on_get_all_filenames(&header, m).await,
            Message::GetAllFilenamesReply(m) => handler.on_get_all_filenames_reply(&header, m).await,
            Message::GetChecksum(m) => handler.on_get_checksum(&header, m).await,
            Message::GetChecksumReply(m) => handler.on_get_checksum_reply(&header, m).await,
        };

        if let Err(e) = result {
            self.reject(&header, kind, e).await;
        }
    }

    async fn reject(&self, header: &Header, kind: MessageKind, error: Error) {
        let handler = self.handler.as_ref();
        if error.is_security_violation() {
            tracing::error!(
                "{} refused {} {} from {}: {}",
                handler.name(),
                kind,
                header.id,
                header.sender,
                error
            );
        } else {
            tracing::warn!(
                "{} failed to handle {} {} from {}: {}",
                handler.name(),
                kind,
                header.id,
                header.sender,
                error
            );
        }

        if header.reply_to.is_none() {
            return;
        }
        if let Some(reply) = kind.not_ok_reply(handler.replica_id(), error.to_string()) {
            if let Err(e) = self.transport.reply(handler.name(), header, reply).await {
                tracing::warn!("Could not send not-ok reply for {} {}: {}", kind, header.id, e);
            }
        }
    }

    /// Receive and dispatch until the inbox closes or shutdown is signalled.
    ///
    /// Every envelope is handled on its own task.
    pub async fn run(self, mut inbox: Inbox, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("{} message loop started", self.handler.name());

        loop {
            tokio::select! {
                received = inbox.recv() => {
                    match received {
                        Some(envelope) => {
                            let router = self.clone();
                            tokio::spawn(async move { router.dispatch(envelope).await });
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("{} message loop stopped", self.handler.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{inbox, LocalTransport};

    struct HeartbeatOnly;

    #[async_trait]
    impl MessageHandler for HeartbeatOnly {
        fn name(&self) -> &'static str {
            "HeartbeatOnly"
        }

        fn replica_id(&self) -> &str {
            "ONE"
        }

        async fn on_heartbeat(&self, _header: &Header, _msg: Heartbeat) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unhandled_kind_gets_not_ok_reply() {
        let hub = Arc::new(LocalTransport::new());
        let (client, mut replies) = inbox("client");
        hub.subscribe(Destination::Client("client".into()), client).await.unwrap();

        let router = MessageRouter::new(Arc::new(HeartbeatOnly), hub.clone());
        let request = Envelope::new("client", Message::Upload(UploadRequest {
            filename: "a.warc".into(),
            content: b"data".to_vec(),
        }))
        .reply_to(Destination::Client("client".into()));
        let request_id = request.id();

        router.dispatch(request).await;

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.header.in_reply_to, Some(request_id));
        match reply.body {
            Message::UploadReply(r) => {
                assert!(!r.ok);
                assert_eq!(r.replica_id, "ONE");
                assert!(r.error.unwrap().contains("No handler for Upload messages in HeartbeatOnly"));
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
    }

    struct Refusing;

    #[async_trait]
    impl MessageHandler for Refusing {
        fn name(&self) -> &'static str {
            "Refusing"
        }

        fn replica_id(&self) -> &str {
            "TWO"
        }

        async fn on_remove_and_get(&self, _header: &Header, msg: RemoveAndGetRequest) -> Result<()> {
            Err(Error::SecurityViolation(format!("wrong credentials for '{}'", msg.filename)))
        }
    }

    #[tokio::test]
    async fn test_security_refusal_reaches_requester() {
        let hub = Arc::new(LocalTransport::new());
        let (client, mut replies) = inbox("client");
        hub.subscribe(Destination::Client("client".into()), client).await.unwrap();
        let router = MessageRouter::new(Arc::new(Refusing), hub.clone());

        router
            .dispatch(
                Envelope::new("client", Message::RemoveAndGet(RemoveAndGetRequest {
                    filename: "a.warc".into(),
                    replica_id: "TWO".into(),
                    expected_checksum: "aaa".into(),
                    credentials: "guess".into(),
                }))
                .reply_to(Destination::Client("client".into())),
            )
            .await;

        match replies.recv().await.unwrap().body {
            Message::RemoveAndGetReply(r) => {
                assert!(!r.ok);
                assert_eq!(r.replica_id, "TWO");
                assert_eq!(r.error.as_deref(), Some("Security violation: wrong credentials for 'a.warc'"));
            }
            other => panic!("Wrong reply type: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_handled_kind_and_unanswerable_errors_stay_silent() {
        let hub = Arc::new(LocalTransport::new());
        let (client, mut replies) = inbox("client");
        hub.subscribe(Destination::Client("client".into()), client).await.unwrap();
        let router = MessageRouter::new(Arc::new(HeartbeatOnly), hub.clone());

        router
            .dispatch(
                Envelope::new("ONE", Message::Heartbeat(Heartbeat {
                    replica_id: "ONE".into(),
                    timestamp: chrono::Utc::now(),
                }))
                .reply_to(Destination::Client("client".into())),
            )
            .await;
        // BatchEnded is unhandled here but has no reply kind
        router
            .dispatch(
                Envelope::new("ONE", Message::BatchEnded(BatchEnded {
                    replica_id: "ONE".into(),
                    files_processed: 0,
                    files_failed: Vec::new(),
                    result: Vec::new(),
                    error: None,
                }))
                .reply_to(Destination::Client("client".into())),
            )
            .await;

        assert!(replies.try_recv().is_err());
    }
}
