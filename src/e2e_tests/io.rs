//! Reads, writes, pipes and compounding through the full stack

use super::{count, test_config, MockServer, TestContext};
use crate::client::{HandleKind, OpenOptions};
use crate::config::EofPolicy;
use crate::error::{ErrorKind, NtStatus};
use crate::protocol::smb2_constants::{file_info_class, InfoType};
use crate::ClientConfig;
use std::sync::Arc;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_back() {
        let ctx = TestContext::new();
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("notes.txt", OpenOptions::create()).await.unwrap();
        assert_eq!(handle.kind(), HandleKind::File);

        assert_eq!(handle.write(0, b"hello world").await.unwrap(), 11);
        assert_eq!(handle.read(0, 100).await.unwrap(), b"hello world");
        assert_eq!(handle.read(6, 5).await.unwrap(), b"world");
        assert_eq!(ctx.server.file("notes.txt").unwrap(), b"hello world");

        // Past the end is an empty read by default
        assert!(handle.read(11, 10).await.unwrap().is_empty());

        handle.flush().await.unwrap();
        let info = handle
            .query_info(InfoType::File, file_info_class::FILE_STANDARD_INFORMATION, 64)
            .await
            .unwrap();
        assert_eq!(info, 11u64.to_le_bytes());

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_of_file_as_error() {
        let config = ClientConfig {
            eof_policy: EofPolicy::Error,
            ..test_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        ctx.server.put_file("short.txt", b"abc");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("short.txt", OpenOptions::read()).await.unwrap();

        assert_eq!(handle.read(0, 10).await.unwrap(), b"abc");
        let err = handle.read(3, 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolStatus);
        assert_eq!(err.nt_status(), Some(NtStatus::EndOfFile));
        // Not stale, not transient: exactly one attempt
        assert_eq!(count(&ctx.server.stats.reads), 2);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_io_split_to_negotiated_limits() {
        let config = ClientConfig {
            max_read_size: 4096,
            max_write_size: 4096,
            ..test_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("big.bin", OpenOptions::create()).await.unwrap();

        let data = pattern(10_000);
        assert_eq!(handle.write(0, &data).await.unwrap(), 10_000);
        assert_eq!(count(&ctx.server.stats.writes), 3);
        assert_eq!(ctx.server.file("big.bin").unwrap(), data);

        // Reads beyond the limit come back short
        let head = handle.read(0, 10_000).await.unwrap();
        assert_eq!(head, &data[..4096]);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_read_charges_several_credits() {
        let ctx = TestContext::new();
        let data = pattern(200_000);
        ctx.server.put_file("large.bin", &data);
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("large.bin", OpenOptions::read()).await.unwrap();

        assert_eq!(handle.read(0, 200_000).await.unwrap(), data);
        assert_eq!(count(&ctx.server.stats.credit_violations), 0);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_many_shares_one_frame() {
        let config = ClientConfig {
            use_batching: true,
            max_compound_count: 4,
            ..test_config()
        };
        let ctx = TestContext::with(MockServer::new(), config);
        ctx.server.put_file("letters.txt", b"abcdefgh");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("letters.txt", OpenOptions::read()).await.unwrap();

        let frames = count(&ctx.server.stats.frames);
        let results = handle
            .read_many(&[(0, 2), (2, 2), (4, 2), (6, 10)])
            .await
            .unwrap();
        assert_eq!(count(&ctx.server.stats.frames), frames + 1);
        assert_eq!(count(&ctx.server.stats.reads), 4);

        let chunks: Vec<Vec<u8>> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks, vec![b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec(), b"gh".to_vec()]);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_many_without_batching_sends_separately() {
        let ctx = TestContext::new();
        ctx.server.put_file("letters.txt", b"abcdefgh");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("letters.txt", OpenOptions::read()).await.unwrap();

        let frames = count(&ctx.server.stats.frames);
        let results = handle.read_many(&[(0, 4), (4, 4)]).await.unwrap();
        assert_eq!(count(&ctx.server.stats.frames), frames + 2);
        assert_eq!(results[1].as_ref().unwrap(), b"efgh");

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_transact_on_ipc_share() {
        let ctx = TestContext::new();
        let session = ctx.session().await;
        let pipes = session.tree("IPC$").await.unwrap();
        assert!(pipes.info().unwrap().signing_required);

        let pipe = pipes.open_pipe("srvsvc").await.unwrap();
        assert_eq!(pipe.kind(), HandleKind::Pipe);
        assert_eq!(pipe.transact(b"ping", 1024).await.unwrap(), b"re:ping");
        assert!(count(&ctx.server.stats.signed_requests) >= 2);
        assert_eq!(count(&ctx.server.stats.bad_signatures), 0);

        pipe.close().await.unwrap();
        pipes.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_transact_needs_a_pipe() {
        let ctx = TestContext::new();
        ctx.server.put_file("a.txt", b"x");
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = tree.open("a.txt", OpenOptions::read()).await.unwrap();

        let err = handle.transact(b"ping", 16).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Local);
        assert_eq!(count(&ctx.server.stats.ioctls), 0);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_reads_respect_credit_window() {
        let server = MockServer {
            credits_per_response: 1,
            ..MockServer::new()
        };
        let ctx = TestContext::with(server, test_config());
        ctx.server.put_file("shared.bin", &pattern(4096));
        let session = ctx.session().await;
        let tree = session.tree("public").await.unwrap();
        let handle = Arc::new(tree.open("shared.bin", OpenOptions::read()).await.unwrap());

        let tasks: Vec<_> = (0..8u64)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.read(i * 512, 512).await })
            })
            .collect();
        for (i, task) in tasks.into_iter().enumerate() {
            let chunk = task.await.unwrap().unwrap();
            assert_eq!(chunk, &pattern(4096)[i * 512..(i + 1) * 512]);
        }
        assert_eq!(count(&ctx.server.stats.reads), 8);
        assert_eq!(count(&ctx.server.stats.credit_violations), 0);

        handle.close().await.unwrap();
        tree.release().await.unwrap();
        session.release().await.unwrap();
    }
}
