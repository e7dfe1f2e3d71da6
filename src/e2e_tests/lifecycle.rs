//! Reference counting and explicit lifecycle of sessions, trees and handles

use super::{alice, count, test_config, MockServer, TestContext, HOST};
use crate::auth::AnonymousCredentials;
use crate::client::{HandleState, OpenOptions, SessionState, TreeState};
use crate::error::{Error, ErrorKind, NtStatus};
use crate::protocol::messages::ShareType;
use crate::ClientConfig;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_tree_disconnects_on_last_release() {
        let ctx = TestContext::new();
        let stats = &ctx.server.stats;
        ctx.server.put_file("a.txt", b"hello");

        let session = ctx.session().await;
        assert_eq!(session.state(), SessionState::Valid);
        assert_eq!(session.references(), 1);

        let tree = session.tree("public").await.unwrap();
        let again = session.tree("PUBLIC").await.unwrap();
        assert_eq!(tree.key(), again.key());
        assert_eq!(tree.references(), 2);
        assert_eq!(tree.state(), TreeState::Connected);
        assert_eq!(count(&stats.tree_connects), 1);
        // The tree record holds the session
        assert_eq!(session.references(), 2);

        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();
        assert_eq!(handle.state(), HandleState::Open);
        assert_eq!(tree.references(), 3);

        handle.close().await.unwrap();
        assert_eq!(tree.references(), 2);
        assert_eq!(count(&stats.closes), 1);

        again.release().await.unwrap();
        assert_eq!(count(&stats.tree_disconnects), 0);
        assert_eq!(ctx.client.tree_count(), 1);

        tree.release().await.unwrap();
        assert_eq!(count(&stats.tree_disconnects), 1);
        assert_eq!(ctx.client.tree_count(), 0);
        assert_eq!(session.references(), 1);

        session.release().await.unwrap();
        assert_eq!(count(&stats.logoffs), 1);
        assert_eq!(ctx.client.session_count(), 0);
        assert_eq!(ctx.client.active_connections().await, 0);
    }

    #[tokio::test]
    async fn test_ensure_calls_are_free_when_established() {
        let ctx = TestContext::new();
        ctx.server.put_file("a.txt", b"hello");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        let frames = count(&ctx.server.stats.frames);
        session.authenticate().await.unwrap();
        tree.ensure_connected().await.unwrap();
        tree.ensure_connected().await.unwrap();
        handle.ensure_tree_connected().await.unwrap();
        handle.ensure_open().await.unwrap();
        handle.ensure_open().await.unwrap();
        assert_eq!(count(&ctx.server.stats.frames), frames);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let ctx = TestContext::new();
        ctx.server.put_file("a.txt", b"hello");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(count(&ctx.server.stats.closes), 1);
        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(ctx.client.handle_count(), 0);

        let err = handle.read(0, 5).await.unwrap_err();
        assert!(matches!(err, Error::HandleClosed));
        assert_eq!(err.kind(), ErrorKind::LifecycleViolation);
        assert!(matches!(
            handle.write(0, b"x").await.unwrap_err(),
            Error::HandleClosed
        ));

        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_open_returns_tree_reference() {
        let ctx = TestContext::new();
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();

        let err = tree.open("missing.txt", OpenOptions::read()).await.unwrap_err();
        assert_eq!(err.nt_status(), Some(NtStatus::ObjectNameNotFound));
        assert_eq!(tree.references(), 1);
        assert_eq!(ctx.client.handle_count(), 0);
        assert_eq!(count(&ctx.server.stats.closes), 0);

        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_share_is_not_kept() {
        let ctx = TestContext::new();
        let session = ctx.session().await;

        let err = session.tree("nosuchshare").await.unwrap_err();
        assert_eq!(err.nt_status(), Some(NtStatus::BadNetworkName));
        assert_eq!(ctx.client.tree_count(), 0);
        assert_eq!(session.references(), 1);

        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_shared_per_identity() {
        let ctx = TestContext::new();
        let stats = &ctx.server.stats;

        let first = ctx.session().await;
        let second = ctx.client.session(HOST, alice()).unwrap();
        assert_eq!(first.key(), second.key());
        assert_eq!(first.references(), 2);
        second.authenticate().await.unwrap();
        assert_eq!(count(&stats.session_setups), 2);

        let anonymous = ctx
            .client
            .connect(HOST, Arc::new(AnonymousCredentials))
            .await
            .unwrap();
        assert_ne!(anonymous.key(), first.key());
        assert_eq!(count(&stats.session_setups), 3);
        assert_eq!(count(&stats.connections), 1);
        assert_eq!(ctx.client.active_connections().await, 1);

        let pipes = anonymous.tree("IPC$").await.unwrap();
        let info = pipes.info().unwrap();
        assert_eq!(info.share_type, ShareType::Pipe);
        assert!(!info.signing_required);
        pipes.release().await.unwrap();

        second.release().await.unwrap();
        assert_eq!(count(&stats.logoffs), 0);
        first.release().await.unwrap();
        anonymous.release().await.unwrap();
        assert_eq!(count(&stats.logoffs), 2);
        assert_eq!(ctx.client.active_connections().await, 0);
    }

    #[tokio::test]
    async fn test_double_release_is_a_violation() {
        let config = ClientConfig {
            strict_resource_lifecycle: true,
            ..test_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();

        tree.release().await.unwrap();
        let err = tree.release().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LifecycleViolation);
        assert_eq!(count(&ctx.server.stats.tree_disconnects), 1);

        let err = tree.open("a.txt", OpenOptions::read()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LifecycleViolation);

        session.release().await.unwrap();
        assert_eq!(
            session.release().await.unwrap_err().kind(),
            ErrorKind::LifecycleViolation
        );
        assert!(session.acquire().is_err());
    }

    #[tokio::test]
    async fn test_dropped_handle_closes_in_background() {
        let ctx = TestContext::new();
        ctx.server.put_file("a.txt", b"hello");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();

        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();
        assert_eq!(tree.references(), 2);
        drop(handle);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count(&ctx.server.stats.closes), 1);
        assert_eq!(ctx.client.handle_count(), 0);
        assert_eq!(tree.references(), 1);

        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquired_session_outlives_original() {
        let ctx = TestContext::new();
        let session = ctx.session().await;
        let extra = session.acquire().unwrap();
        assert_eq!(session.references(), 2);

        session.release().await.unwrap();
        assert_eq!(count(&ctx.server.stats.logoffs), 0);
        extra.echo().await.unwrap();
        assert_eq!(count(&ctx.server.stats.echoes), 1);

        extra.release().await.unwrap();
        assert_eq!(count(&ctx.server.stats.logoffs), 1);
    }
}
