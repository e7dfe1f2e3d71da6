//! Signing, authentication failures and share policy

use super::test_context::PasswordCredentials;
use super::{alice, count, test_config, MockServer, TestContext, HOST};
use crate::auth::AnonymousCredentials;
use crate::client::{OpenOptions, SessionState};
use crate::error::{Error, ErrorKind};
use crate::protocol::smb2_constants::{Smb2Command, Smb2Dialect};
use crate::protocol::Smb2Header;
use crate::ClientConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn signing_server() -> MockServer {
    MockServer {
        signing_required: true,
        ..MockServer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_required_signing() {
        let ctx = TestContext::with(signing_server(), test_config());
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        assert!(tree.info().unwrap().signing_required);

        let handle = tree.open("signed.txt", OpenOptions::create()).await.unwrap();
        handle.write(0, b"integrity").await.unwrap();
        assert_eq!(handle.read(0, 64).await.unwrap(), b"integrity");

        let stats = &ctx.server.stats;
        assert!(count(&stats.signed_requests) >= 4);
        assert_eq!(count(&stats.bad_signatures), 0);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_aes_cmac_signing_on_smb3() {
        let config = ClientConfig {
            dialects: vec![Smb2Dialect::Smb210, Smb2Dialect::Smb302],
            ..test_config()
        };
        let ctx = TestContext::with(signing_server(), config);
        ctx.server.put_file("a.txt", b"smb3");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        assert_eq!(handle.read(0, 16).await.unwrap(), b"smb3");
        assert!(count(&ctx.server.stats.signed_requests) > 0);
        assert_eq!(count(&ctx.server.stats.bad_signatures), 0);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_signature_kills_the_connection() {
        let ctx = TestContext::with(signing_server(), test_config());
        ctx.server.put_file("a.txt", b"payload");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        ctx.server
            .faults
            .corrupt_next_signature
            .store(true, Ordering::SeqCst);
        let err = handle.read(0, 64).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureFailure);
        assert_eq!(count(&ctx.server.stats.reads), 1);

        // Next use runs on a fresh connection
        assert_eq!(handle.read(0, 64).await.unwrap(), b"payload");
        assert_eq!(count(&ctx.server.stats.connections), 2);
        assert_eq!(count(&ctx.server.stats.session_setups), 4);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_terminal() {
        let ctx = TestContext::new();
        ctx.server.faults.reject_auth.store(true, Ordering::SeqCst);
        let stats = &ctx.server.stats;

        let session = ctx.client.session(HOST, alice()).unwrap();
        let err = session.authenticate().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(session.state(), SessionState::Rejected);
        assert_eq!(count(&stats.session_setups), 2);

        assert_eq!(
            session.authenticate().await.unwrap_err().kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            session.tree("public").await.unwrap_err().kind(),
            ErrorKind::Authentication
        );
        assert_eq!(count(&stats.session_setups), 2);
        assert_eq!(count(&stats.tree_connects), 0);

        // A new request for the same identity starts over
        let retry = ctx.client.session(HOST, alice()).unwrap();
        assert_ne!(retry.key(), session.key());

        retry.release().await.unwrap();
        session.release().await.unwrap();
        assert_eq!(ctx.client.session_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let ctx = TestContext::new();
        let err = ctx
            .client
            .connect(HOST, Arc::new(PasswordCredentials::new("mallory", "guess")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(ctx.client.session_count(), 0);
        assert_eq!(ctx.client.active_connections().await, 0);
    }

    #[tokio::test]
    async fn test_anonymous_cannot_meet_required_signing() {
        let config = ClientConfig {
            signing_required: true,
            ..test_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        let err = ctx
            .client
            .connect(HOST, Arc::new(AnonymousCredentials))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(count(&ctx.server.stats.session_setups), 0);
    }

    fn smb3_config() -> ClientConfig {
        ClientConfig {
            dialects: vec![Smb2Dialect::Smb210, Smb2Dialect::Smb302],
            ..test_config()
        }
    }

    #[tokio::test]
    async fn test_encrypted_share_on_smb3() {
        let ctx = TestContext::with(MockServer::new(), smb3_config());
        let session = ctx.session().await;
        let secure = session.tree("secure").await.unwrap();
        assert!(secure.info().unwrap().encryption_required);

        let handle = secure.open("secret.txt", OpenOptions::create()).await.unwrap();
        assert_eq!(handle.write(0, b"for your eyes only").await.unwrap(), 18);
        assert_eq!(handle.read(0, 64).await.unwrap(), b"for your eyes only");
        assert_eq!(ctx.server.file("secret.txt").unwrap(), b"for your eyes only");
        // Create, write, read
        let stats = &ctx.server.stats;
        assert!(count(&stats.encrypted_frames) >= 3);
        assert_eq!(count(&stats.bad_signatures), 0);

        // Plain shares of the same session stay plain
        let sealed = count(&stats.encrypted_frames);
        let public = session.tree("public").await.unwrap();
        let plain = public.open("plain.txt", OpenOptions::create()).await.unwrap();
        plain.write(0, b"hello").await.unwrap();
        assert_eq!(count(&stats.encrypted_frames), sealed);

        plain.close().await.unwrap();
        public.release().await.unwrap();
        handle.close().await.unwrap();
        secure.release().await.unwrap();
        assert_eq!(count(&stats.tree_disconnects), 2);
        session.release().await.unwrap();
        assert_eq!(count(&stats.logoffs), 1);
    }

    #[tokio::test]
    async fn test_encrypted_session_seals_everything() {
        let server = MockServer {
            encrypt_sessions: true,
            ..MockServer::new()
        };
        let ctx = TestContext::with(server, smb3_config());
        let session = ctx.session().await;
        session.echo().await.unwrap();
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::create()).await.unwrap();
        handle.write(0, b"sealed").await.unwrap();

        // Negotiate and the two session setup legs are the only plain frames
        let stats = &ctx.server.stats;
        assert_eq!(count(&stats.frames) - count(&stats.encrypted_frames), 3);
        assert_eq!(count(&stats.signed_requests), 0);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
        assert_eq!(count(&stats.logoffs), 1);
    }

    #[tokio::test]
    async fn test_required_encryption_needs_smb3() {
        let config = ClientConfig {
            encryption_required: true,
            ..test_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        let err = ctx.client.connect(HOST, alice()).await.unwrap_err();
        assert!(matches!(err, Error::EncryptionUnsupported(_)));

        let config = ClientConfig {
            encryption_required: true,
            ..smb3_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        let session = ctx.session().await;
        session.echo().await.unwrap();
        assert_eq!(count(&ctx.server.stats.encrypted_frames), 1);
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_encrypted_share_is_refused_without_smb3() {
        let ctx = TestContext::new();
        let session = ctx.session().await;

        let err = session.tree("secure").await.unwrap_err();
        assert!(matches!(err, Error::EncryptionUnsupported(_)));
        assert_eq!(count(&ctx.server.stats.tree_connects), 1);
        assert_eq!(count(&ctx.server.stats.tree_disconnects), 1);
        assert_eq!(ctx.client.tree_count(), 0);
        assert_eq!(session.references(), 1);

        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_signing_follows_configuration() {
        let config = ClientConfig {
            ipc_signing_enforced: false,
            ..test_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        let session = ctx.session().await;

        let pipes = session.tree("IPC$").await.unwrap();
        assert!(!pipes.info().unwrap().signing_required);
        let pipe = pipes.open_pipe("srvsvc").await.unwrap();
        assert_eq!(pipe.transact(b"hi", 64).await.unwrap(), b"re:hi");
        assert_eq!(count(&ctx.server.stats.signed_requests), 0);

        pipe.close().await.unwrap();
        pipes.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_sign_and_verify() {
        let ctx = TestContext::new();
        let session = ctx.session().await;

        let mut message = Smb2Header::new(Smb2Command::Echo).serialize().unwrap();
        message.extend_from_slice(&[4, 0, 0, 0]);
        session.sign(&mut message).unwrap();
        session.verify(&message).unwrap();

        message[Smb2Header::SIZE] ^= 0xFF;
        let err = session.verify(&message).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureFailure);

        let anonymous = ctx
            .client
            .connect(HOST, Arc::new(AnonymousCredentials))
            .await
            .unwrap();
        assert!(anonymous.sign(&mut message).is_err());

        anonymous.release().await.unwrap();
        session.release().await.unwrap();
    }
}
