//! Retry and stale-state recovery
//!
//! Faults are injected once the path is established, so the counters only
//! reflect what recovery itself sent.

use super::{count, test_config, MockServer, TestContext};
use crate::client::OpenOptions;
use crate::error::{ErrorKind, NtStatus};
use crate::protocol::smb2_constants::CreateDisposition;
use crate::ClientConfig;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idempotent_read_retried_on_new_connection() {
        let ctx = TestContext::new();
        let stats = &ctx.server.stats;
        ctx.server.put_file("a.txt", b"payload");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        ctx.server.faults.fail_reads.store(2, Ordering::SeqCst);
        assert_eq!(handle.read(0, 64).await.unwrap(), b"payload");

        assert_eq!(count(&stats.reads), 3);
        assert_eq!(count(&stats.connections), 3);
        // Every reconnect re-authenticates, reconnects the tree and reopens
        assert_eq!(count(&stats.session_setups), 6);
        assert_eq!(count(&stats.tree_connects), 3);
        assert_eq!(count(&stats.creates), 3);
        assert_eq!(ctx.client.active_connections().await, 1);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
        assert_eq!(ctx.client.active_connections().await, 0);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let ctx = TestContext::new();
        ctx.server.put_file("a.txt", b"payload");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        ctx.server.faults.fail_reads.store(10, Ordering::SeqCst);
        let err = handle.read(0, 64).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        // One attempt plus max_retries
        assert_eq!(count(&ctx.server.stats.reads), 3);

        ctx.server.faults.fail_reads.store(0, Ordering::SeqCst);
        assert_eq!(handle.read(0, 7).await.unwrap(), b"payload");

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_is_never_retried() {
        let ctx = TestContext::new();
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("out.txt", OpenOptions::create()).await.unwrap();

        ctx.server.faults.fail_writes.store(1, Ordering::SeqCst);
        let err = handle.write(0, b"lost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert_eq!(count(&ctx.server.stats.writes), 1);
        assert_eq!(count(&ctx.server.stats.connections), 1);

        // The next call re-establishes everything lazily
        assert_eq!(handle.write(0, b"kept").await.unwrap(), 4);
        assert_eq!(count(&ctx.server.stats.writes), 2);
        assert_eq!(count(&ctx.server.stats.connections), 2);
        assert_eq!(
            ctx.server.dispositions(),
            vec![CreateDisposition::OverwriteIf, CreateDisposition::Open]
        );
        assert_eq!(ctx.server.file("out.txt").unwrap(), b"kept");

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_tree_reconnects_once() {
        let ctx = TestContext::new();
        let stats = &ctx.server.stats;
        ctx.server.put_file("a.txt", b"payload");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        ctx.server.faults.expire_trees.store(true, Ordering::SeqCst);
        assert_eq!(handle.read(0, 64).await.unwrap(), b"payload");

        assert_eq!(count(&stats.tree_connects), 2);
        assert_eq!(count(&stats.creates), 2);
        assert_eq!(count(&stats.session_setups), 2);
        assert_eq!(count(&stats.connections), 1);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_session_reauthenticates() {
        let ctx = TestContext::new();
        let stats = &ctx.server.stats;
        ctx.server.put_file("a.txt", b"payload");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        ctx.server.faults.expire_sessions.store(true, Ordering::SeqCst);
        assert_eq!(handle.read(0, 64).await.unwrap(), b"payload");

        assert_eq!(count(&stats.session_setups), 4);
        assert_eq!(count(&stats.tree_connects), 2);
        assert_eq!(count(&stats.creates), 2);
        assert_eq!(count(&stats.connections), 1);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_file_reopens_without_truncating() {
        let ctx = TestContext::new();
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("log.txt", OpenOptions::create()).await.unwrap();
        handle.write(0, b"first").await.unwrap();

        // A write is not idempotent, yet stale-handle recovery still applies
        ctx.server.faults.expire_handles.store(true, Ordering::SeqCst);
        assert_eq!(handle.write(5, b"second").await.unwrap(), 6);

        assert_eq!(ctx.server.file("log.txt").unwrap(), b"firstsecond");
        assert_eq!(
            ctx.server.dispositions(),
            vec![CreateDisposition::OverwriteIf, CreateDisposition::Open]
        );
        assert_eq!(count(&ctx.server.stats.tree_connects), 1);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_state_recovered_only_once() {
        let ctx = TestContext::new();
        let stats = &ctx.server.stats;
        ctx.server.put_file("a.txt", b"payload");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        // The tree goes first; the reopened handle then goes stale too
        ctx.server.faults.expire_trees.store(true, Ordering::SeqCst);
        ctx.server.faults.expire_handles.store(true, Ordering::SeqCst);
        let err = handle.read(0, 64).await.unwrap_err();
        assert_eq!(err.nt_status(), Some(NtStatus::FileClosed));
        assert_eq!(count(&stats.tree_connects), 2);
        assert_eq!(count(&stats.creates), 2);

        // A fresh call gets its own recovery
        assert_eq!(handle.read(0, 64).await.unwrap(), b"payload");
        assert_eq!(count(&stats.creates), 3);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_surfaces_without_retry() {
        let config = ClientConfig {
            response_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        ctx.server.put_file("a.txt", b"payload");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        ctx.server.faults.delay_ms.store(300, Ordering::SeqCst);
        let err = handle.read(0, 64).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(count(&ctx.server.stats.reads), 1);

        // The late response is dropped and the connection stays usable
        ctx.server.faults.delay_ms.store(0, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handle.read(0, 64).await.unwrap(), b"payload");
        assert_eq!(count(&ctx.server.stats.connections), 1);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }
}
