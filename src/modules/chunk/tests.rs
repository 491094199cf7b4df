// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::chunk::decode::PartDecoder;
use crate::modules::chunk::reader::{ChunkedReader, MessageCache};
use crate::modules::chunk::stream::ChunkStream;
use crate::modules::envelope::{Envelope, Protocol};
use crate::modules::hash::HashKey;
use crate::modules::scanner::fixtures::NESTED_MESSAGE;
use crate::modules::storage::memory::MemoryStorage;
use crate::modules::storage::{Storage, StorageConfig};
use std::sync::Arc;
use std::time::Duration;

const HTML_QP_MESSAGE: &str = "From: newsletter@example.com\n\
Subject: weekly digest\n\
Content-Type: multipart/mixed; boundary=\"digest-frame\"\n\
\n\
--digest-frame\n\
Content-Type: text/html; charset=utf-8\n\
Content-Transfer-Encoding: quoted-printable\n\
\n\
<html>\n\
  <body>caf=C3=A9 =3D fun</body>\n\
</html>\n\
--digest-frame--\n";

async fn memory() -> Arc<MemoryStorage> {
    let storage = MemoryStorage::new();
    storage.initialize(&StorageConfig::default()).await.unwrap();
    storage
}

fn envelope() -> Envelope {
    Envelope {
        from: "vice-president@whitehouse.example".into(),
        to: "transport@whitehouse.example".into(),
        helo: "mail.whitehouse.example".into(),
        recipient: "transport@whitehouse.example".into(),
        queued_id: HashKey::digest(b"queue-entry"),
        remote_ip: Some("198.51.100.7".parse().unwrap()),
        protocol: Protocol::Esmtp,
        ..Default::default()
    }
}

/// SMTP-encode a message: stuff leading dots, CRLF line ends, dot
/// terminator.
fn dot_stuff(msg: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for line in msg.split_inclusive('\n') {
        if line.starts_with('.') {
            out.push(b'.');
        }
        out.extend_from_slice(line.trim_end_matches('\n').as_bytes());
        if line.ends_with('\n') {
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b".\r\n");
    out
}

async fn store(storage: &Arc<MemoryStorage>, msg: &str, cap: usize) -> u64 {
    store_split(storage, msg, cap, &[]).await
}

async fn store_split(storage: &Arc<MemoryStorage>, msg: &str, cap: usize, splits: &[usize]) -> u64 {
    let mut stream = ChunkStream::new(storage.clone());
    stream.cap_to(cap);
    stream.open(&envelope()).await.unwrap();
    let stuffed = dot_stuff(msg);
    let mut done = false;
    let mut start = 0usize;
    for &split in splits {
        done = stream.write(&stuffed[start..split]).await.unwrap();
        start = split;
    }
    if start < stuffed.len() {
        done = stream.write(&stuffed[start..]).await.unwrap();
    }
    assert!(done, "terminator not reached");
    stream.close().await.unwrap()
}

#[tokio::test]
async fn nested_message_end_to_end() {
    let storage = memory().await;
    let mail_id = store(&storage, NESTED_MESSAGE, 256).await;

    let email = storage.get_message(mail_id).await.unwrap();
    assert!(email.finalized);
    assert_eq!(email.size as usize, NESTED_MESSAGE.len());
    assert_eq!(email.subject, "[Fwd: Map of Argentina with Description]");
    assert_eq!(email.from, "vice-president@whitehouse.example");

    let info = email.parts_info.as_ref().unwrap();
    let ids: Vec<&str> = info.parts.iter().map(|p| p.part_id.as_str()).collect();
    assert_eq!(ids, ["1", "1.1", "1.2", "1.2.1", "1.2.1.1", "1.2.1.2"]);
    assert_eq!(info.count, 6);
    assert_eq!(info.text_part, 1);
    assert_eq!(info.html_part, -1);
    assert!(!info.has_attach);
    assert_eq!(info.boundaries.len(), 2);
    for part in &info.parts {
        assert!(!part.chunk_hashes.is_empty());
        let boundary = &info.boundaries[part.content_boundary_index as usize];
        assert!(!boundary.is_empty());
    }
}

#[tokio::test]
async fn round_trip_reconstructs_the_stream() {
    let storage = memory().await;
    let mail_id = store(&storage, NESTED_MESSAGE, 128).await;
    let email = storage.get_message(mail_id).await.unwrap();
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let mut reader = ChunkedReader::new(dyn_storage, &email, 0).unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, NESTED_MESSAGE.as_bytes());
}

#[tokio::test]
async fn split_discipline_covers_without_gaps() {
    let storage = memory().await;
    let mail_id = store(&storage, NESTED_MESSAGE, 200).await;
    let email = storage.get_message(mail_id).await.unwrap();
    let info = email.parts_info.as_ref().unwrap();
    let total: u64 = info.parts.iter().map(|p| p.size).sum();
    assert_eq!(total as usize, NESTED_MESSAGE.len());
    // per-part ranges are contiguous: draining parts in order equals
    // draining the whole message
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let mut whole = Vec::new();
    for i in 1..=info.parts.len() {
        let mut reader = ChunkedReader::new(dyn_storage.clone(), &email, i).unwrap();
        reader.read_to_end(&mut whole).await.unwrap();
    }
    assert_eq!(whole, NESTED_MESSAGE.as_bytes());
}

#[tokio::test]
async fn chunk_set_is_independent_of_slice_splits() {
    let storage = memory().await;
    let reference = store(&storage, NESTED_MESSAGE, 256).await;
    let reference = storage
        .get_message(reference)
        .await
        .unwrap()
        .parts_info
        .unwrap();
    let stuffed_len = dot_stuff(NESTED_MESSAGE).len();
    for split in (1..stuffed_len).step_by(97) {
        let storage = memory().await;
        let mail_id = store_split(&storage, NESTED_MESSAGE, 256, &[split]).await;
        let info = storage
            .get_message(mail_id)
            .await
            .unwrap()
            .parts_info
            .unwrap();
        assert_eq!(info, reference, "diverged for split at {}", split);
    }
}

#[tokio::test]
async fn shared_chunks_are_stored_once() {
    let storage = memory().await;
    let first = store(&storage, NESTED_MESSAGE, 256).await;
    let rows_after_first = storage.chunk_count();
    let second = store(&storage, NESTED_MESSAGE, 256).await;
    // identical bytes, identical chunk rows
    assert_eq!(storage.chunk_count(), rows_after_first);

    let info = storage
        .get_message(first)
        .await
        .unwrap()
        .parts_info
        .unwrap();
    let sample = info.parts[1].chunk_hashes[0];
    assert_eq!(storage.reference_count(&sample), Some(2));

    storage.delete_message(first).await.unwrap();
    assert_eq!(storage.reference_count(&sample), Some(1));
    storage.delete_message(second).await.unwrap();
    assert_eq!(storage.reference_count(&sample), Some(0));
    storage.sweep(0).await.unwrap();
    assert_eq!(storage.chunk_count(), 0);
}

#[tokio::test]
async fn headers_and_bodies_live_in_separate_chunks() {
    let storage = memory().await;
    // capacity far above the message size, so chunk edges come from
    // the part and header splits alone
    let mail_id = store(&storage, NESTED_MESSAGE, 64 * 1024).await;
    let email = storage.get_message(mail_id).await.unwrap();
    let info = email.parts_info.as_ref().unwrap();
    let first_chunk = storage
        .get_chunks(&info.parts[0].chunk_hashes[..1])
        .await
        .unwrap()
        .remove(0);
    let text = String::from_utf8(first_chunk.data).unwrap();
    assert!(text.starts_with("From: Al Gore"));
    // the header chunk ends at the blank line; body bytes start the next one
    assert!(text.ends_with("boundary=\"D7F------------D7FD5A0B8AB9C65CCDBFA872\"\n\n"));
}

#[tokio::test]
async fn seek_part_drains_exactly_the_part() {
    let storage = memory().await;
    let mail_id = store(&storage, NESTED_MESSAGE, 128).await;
    let email = storage.get_message(mail_id).await.unwrap();
    let info = email.parts_info.as_ref().unwrap();
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let mut reader = ChunkedReader::new(dyn_storage, &email, 0).unwrap();
    for i in 1..=info.parts.len() {
        reader.seek_part(i).unwrap();
        let mut out = Vec::new();
        let n = reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(n as u64, info.parts[i - 1].size, "part {}", i);
    }
}

#[tokio::test]
async fn base64_image_part_decodes_to_gif() {
    let storage = memory().await;
    let mail_id = store(&storage, NESTED_MESSAGE, 96).await;
    let email = storage.get_message(mail_id).await.unwrap();
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let reader = ChunkedReader::new(dyn_storage, &email, 6).unwrap();
    let mut decoder = PartDecoder::new(reader, 6).unwrap();
    let mut image = Vec::new();
    decoder.read_to_end(&mut image).await.unwrap();
    assert!(image.starts_with(b"GIF89a"), "got {:?}", &image[..6.min(image.len())]);
    // GIF trailer survives the boundary trim
    assert_eq!(image.last(), Some(&0x3B));
}

#[tokio::test]
async fn html_qp_part_decodes() {
    let storage = memory().await;
    let mail_id = store(&storage, HTML_QP_MESSAGE, 64).await;
    let email = storage.get_message(mail_id).await.unwrap();
    let info = email.parts_info.as_ref().unwrap();
    assert!(info.html_part >= 0);
    let html_part = (info.html_part + 1) as usize;
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let reader = ChunkedReader::new(dyn_storage, &email, html_part).unwrap();
    let mut decoder = PartDecoder::new(reader, html_part).unwrap();
    let mut html = Vec::new();
    decoder.read_to_end(&mut html).await.unwrap();
    let html = String::from_utf8(html).unwrap();
    assert!(html.contains("</html>"), "got {:?}", html);
    assert!(html.contains("café = fun"));
}

#[tokio::test]
async fn plain_message_stored_as_single_part() {
    let storage = memory().await;
    let msg = "From: a@example.com\nSubject: plain\n\njust text, nothing mime\n";
    let mail_id = store(&storage, msg, 64).await;
    let email = storage.get_message(mail_id).await.unwrap();
    let info = email.parts_info.as_ref().unwrap();
    assert_eq!(info.parts.len(), 1);
    assert_eq!(info.parts[0].part_id, "1");
    assert!(info.err.is_empty());
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let mut reader = ChunkedReader::new(dyn_storage, &email, 0).unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, msg.as_bytes());
}

#[tokio::test]
async fn message_cache_serves_repeat_reads() {
    let storage = memory().await;
    let mail_id = store(&storage, NESTED_MESSAGE, 256).await;
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let cache = MessageCache::new(16, Duration::from_secs(60));
    let first = cache.load(&dyn_storage, mail_id).await.unwrap();
    let second = cache.load(&dyn_storage, mail_id).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    let mut reader = ChunkedReader::load(dyn_storage, &cache, mail_id, 1)
        .await
        .unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out.len() as u64, first.parts_info.as_ref().unwrap().parts[0].size);
}

#[tokio::test]
async fn preload_window_walks_the_chunk_list() {
    let storage = memory().await;
    // tiny chunks force many fetch batches through the read-ahead
    let mail_id = store(&storage, NESTED_MESSAGE, 32).await;
    let email = storage.get_message(mail_id).await.unwrap();
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let mut reader = ChunkedReader::new(dyn_storage, &email, 0)
        .unwrap()
        .with_preload(3);
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, NESTED_MESSAGE.as_bytes());
}

#[tokio::test]
async fn aborted_stream_leaves_row_for_sweeper() {
    let storage = memory().await;
    let mut stream = ChunkStream::new(storage.clone());
    stream.cap_to(128);
    let mail_id = stream.open(&envelope()).await.unwrap();
    stream
        .write(b"Subject: abandoned\r\n\r\npartial body")
        .await
        .unwrap();
    drop(stream);
    let email = storage.get_message(mail_id).await.unwrap();
    assert!(!email.finalized);
    storage.sweep(0).await.unwrap();
    assert!(storage.get_message(mail_id).await.is_err());
}
