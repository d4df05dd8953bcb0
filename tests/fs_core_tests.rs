use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use remotefs_fuse::error::Error;
use remotefs_fuse::fs::cache::CacheConfig;
use remotefs_fuse::fs::handle::OpenFlags;
use remotefs_fuse::fs::{FsCore, ROOT_INO};
use remotefs_fuse::remote::RemoteClient;
use wiremock::matchers::{body_bytes, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// End-to-end tests for the kernel-facing protocol, driven against a mock
// storage service.

fn core_for(server: &MockServer) -> FsCore {
    FsCore::new(
        RemoteClient::new(&server.uri()).with_retries(1),
        CacheConfig::default(),
    )
}

fn dirent_json(name: &str, is_dir: bool, size: u64) -> String {
    format!(
        r#"{{"name":"{}","is_dir":{},"size":{},"mtime":1700000000,"permissions":"{}"}}"#,
        name,
        if is_dir { 1 } else { 0 },
        size,
        if is_dir { "755" } else { "644" }
    )
}

async fn mock_list(server: &MockServer, rel_path: &str, rows: &[String]) {
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("relPath", rel_path))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("[{}]", rows.join(","))))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_create_write_release_then_lookup_and_read() {
    let server = MockServer::start().await;

    // create issues a zero-length truncating write...
    Mock::given(method("PUT"))
        .and(path("/files"))
        .and(query_param("relPath", "./hello.txt"))
        .and(query_param("offset", "0"))
        .and(body_bytes(Vec::new()))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"message":"ok","written":0}"#),
        )
        .expect(1)
        .mount(&server)
        .await;
    // ...and the streamed handle write follows at the same offset.
    Mock::given(method("PUT"))
        .and(path("/files"))
        .and(query_param("relPath", "./hello.txt"))
        .and(query_param("offset", "0"))
        .and(body_bytes(&b"hi"[..]))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"message":"ok","written":2}"#),
        )
        .expect(1)
        .mount(&server)
        .await;
    mock_list(&server, ".", &[dirent_json("hello.txt", false, 2)]).await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .and(query_param("relPath", "./hello.txt"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-1/2")
                .set_body_bytes(&b"hi"[..]),
        )
        .mount(&server)
        .await;

    let core = core_for(&server);

    let (attr, _, fh) = core
        .create(ROOT_INO, "hello.txt", 0o644, OpenFlags::from_raw(libc::O_WRONLY))
        .await
        .unwrap();
    assert_eq!(attr.size, 0);

    assert_eq!(core.write(fh, 0, Bytes::from_static(b"hi")).await.unwrap(), 2);
    core.release(fh).await.unwrap();

    let (attr, _) = core.lookup(ROOT_INO, "hello.txt").await.unwrap();
    assert_eq!(attr.size, 2);

    let fh2 = core
        .open(attr.ino, OpenFlags::from_raw(libc::O_RDONLY))
        .await
        .unwrap();
    let data = core.read(fh2, 0, 8).await.unwrap();
    assert_eq!(&data[..], b"hi");
    core.release(fh2).await.unwrap();
}

#[tokio::test]
async fn test_mkdir_tree_and_readdir() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mkdir"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mock_list(&server, "./a", &[dirent_json("b", true, 0)]).await;

    let core = core_for(&server);

    let (a_attr, _) = core.mkdir(ROOT_INO, "a", 0o755).await.unwrap();
    let (b_attr, _) = core.mkdir(a_attr.ino, "b", 0o755).await.unwrap();
    assert!(a_attr.is_dir() && b_attr.is_dir());

    let entries = core.readdir(a_attr.ino).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "b"]);
    assert_eq!(entries[0].ino, a_attr.ino);
    assert_eq!(entries[1].ino, ROOT_INO);
    assert_eq!(entries[2].ino, b_attr.ino);
}

#[tokio::test]
async fn test_rename_across_directories_keeps_ino() {
    let server = MockServer::start().await;
    mock_list(
        &server,
        ".",
        &[dirent_json("a", true, 0), dirent_json("b", true, 0)],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("relPath", "./a"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("[{}]", dirent_json("x", false, 4))),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("relPath", "./a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/files/rename"))
        .and(query_param("oldRelPath", "./a/x"))
        .and(query_param("newRelPath", "./b/x"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let core = core_for(&server);

    let (a_attr, _) = core.lookup(ROOT_INO, "a").await.unwrap();
    let (b_attr, _) = core.lookup(ROOT_INO, "b").await.unwrap();
    let (x_attr, _) = core.lookup(a_attr.ino, "x").await.unwrap();

    core.rename(a_attr.ino, "x", b_attr.ino, "x").await.unwrap();

    let moved = remotefs_fuse::path::RelPath::parse("./b/x").unwrap();
    assert_eq!(core.inodes().ino_of(&moved), Some(x_attr.ino));

    let err = core.lookup(a_attr.ino, "x").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_zero_byte_reads_and_writes_are_no_ops() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/files"))
        .and(query_param("relPath", "./empty"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"message":"ok","written":0}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let core = core_for(&server);
    let (attr, _, fh) = core
        .create(ROOT_INO, "empty", 0o644, OpenFlags::from_raw(libc::O_RDWR))
        .await
        .unwrap();

    // Neither touches the wire: the single expected PUT is the create.
    assert_eq!(core.write(fh, 0, Bytes::new()).await.unwrap(), 0);
    assert_eq!(core.read(fh, 0, 4096).await.unwrap().len(), 0);
    assert_eq!(attr.size, 0);
    core.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_read_past_eof_is_clamped() {
    let server = MockServer::start().await;
    mock_list(&server, ".", &[dirent_json("f", false, 10)]).await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .and(wiremock::matchers::header("Range", "bytes=6-9"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 6-9/10")
                .set_body_bytes(&b"6789"[..]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let core = core_for(&server);
    let (attr, _) = core.lookup(ROOT_INO, "f").await.unwrap();
    let fh = core
        .open(attr.ino, OpenFlags::from_raw(libc::O_RDONLY))
        .await
        .unwrap();

    // Range [6, 100) clamps to [6, 9]; start beyond EOF reads nothing.
    assert_eq!(&core.read(fh, 6, 100).await.unwrap()[..], b"6789");
    assert_eq!(core.read(fh, 10, 100).await.unwrap().len(), 0);
    assert_eq!(core.read(fh, 5000, 1).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_non_sequential_write_splits_streams() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/files"))
        .and(query_param("offset", "0"))
        .and(body_bytes(&b"aaaa"[..]))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"message":"ok","written":4}"#),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/files"))
        .and(query_param("offset", "100"))
        .and(body_bytes(&b"bb"[..]))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"message":"ok","written":2}"#),
        )
        .expect(1)
        .mount(&server)
        .await;
    mock_list(&server, ".", &[dirent_json("f", false, 0)]).await;

    let core = core_for(&server);
    let (attr, _) = core.lookup(ROOT_INO, "f").await.unwrap();
    let fh = core
        .open(attr.ino, OpenFlags::from_raw(libc::O_WRONLY))
        .await
        .unwrap();

    // Sequential pair lands in one stream; the jump to 100 opens another.
    assert_eq!(core.write(fh, 0, Bytes::from_static(b"aa")).await.unwrap(), 2);
    assert_eq!(core.write(fh, 2, Bytes::from_static(b"aa")).await.unwrap(), 2);
    assert_eq!(core.write(fh, 100, Bytes::from_static(b"bb")).await.unwrap(), 2);
    core.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_failed_upload_reported_on_flush() {
    let server = MockServer::start().await;
    mock_list(&server, ".", &[dirent_json("f", false, 0)]).await;
    Mock::given(method("PUT"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let core = core_for(&server);
    let (attr, _) = core.lookup(ROOT_INO, "f").await.unwrap();
    let fh = core
        .open(attr.ino, OpenFlags::from_raw(libc::O_WRONLY))
        .await
        .unwrap();

    // The chunk enters the stream; the server's rejection surfaces at flush.
    core.write(fh, 0, Bytes::from_static(b"doomed")).await.unwrap();
    let err = core.flush(fh).await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);

    // The failure was consumed; release is clean.
    core.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_rmdir_refuses_non_empty_directory() {
    let server = MockServer::start().await;
    mock_list(&server, ".", &[dirent_json("d", true, 0)]).await;
    mock_list(&server, "./d", &[dirent_json("child", false, 1)]).await;

    let core = core_for(&server);
    let (_d, _) = core.lookup(ROOT_INO, "d").await.unwrap();
    let err = core.rmdir(ROOT_INO, "d").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);
}

#[tokio::test]
async fn test_unlink_drops_inode_and_caches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("relPath", "."))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("[{}]", dirent_json("f", false, 3))),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("relPath", "."))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/files"))
        .and(query_param("relPath", "./f"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let core = core_for(&server);
    let (attr, _) = core.lookup(ROOT_INO, "f").await.unwrap();
    core.unlink(ROOT_INO, "f").await.unwrap();

    assert_eq!(core.inodes().path_of(attr.ino), None);
    let err = core.lookup(ROOT_INO, "f").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_staleness_bounded_by_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("relPath", "."))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("[{}]", dirent_json("f", false, 5))),
        )
        .mount(&server)
        .await;
    // Out-of-band growth only visible through the metadata endpoint.
    Mock::given(method("GET"))
        .and(path("/list/updatedMetadata"))
        .and(query_param("relPath", "./f"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(dirent_json("f", false, 9)),
        )
        .mount(&server)
        .await;

    let core = FsCore::new(
        RemoteClient::new(&server.uri()).with_retries(1),
        CacheConfig {
            attr_ttl: Duration::from_millis(100),
            dir_ttl: Duration::from_millis(100),
        },
    );

    let (attr, _) = core.lookup(ROOT_INO, "f").await.unwrap();
    assert_eq!(core.getattr(attr.ino).await.unwrap().size, 5);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(core.getattr(attr.ino).await.unwrap().size, 9);
}

#[tokio::test]
async fn test_readdir_preserves_server_order() {
    let server = MockServer::start().await;
    mock_list(
        &server,
        ".",
        &[
            dirent_json("zeta", false, 1),
            dirent_json("alpha", true, 0),
            dirent_json("midway", false, 2),
        ],
    )
    .await;

    let core = core_for(&server);
    let entries = core.readdir(ROOT_INO).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "zeta", "alpha", "midway"]);
}

#[tokio::test]
async fn test_unicode_names_round_trip() {
    let name = "re\u{0301}sume\u{0301} final\u{2013}v2.txt";
    let server = MockServer::start().await;
    mock_list(&server, ".", &[dirent_json(name, false, 7)]).await;

    let core = core_for(&server);
    let (attr, _) = core.lookup(ROOT_INO, name).await.unwrap();
    assert_eq!(attr.size, 7);

    let entries = core.readdir(ROOT_INO).await.unwrap();
    assert_eq!(entries[2].name, name);
    assert_eq!(entries[2].ino, attr.ino);
}

/// Serves slices of a fixed body according to the request's Range header.
struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| {
                let (s, e) = v.split_once('-')?;
                Some((s.parse::<usize>().ok()?, e.parse::<usize>().ok()?))
            });
        match range {
            Some((start, end)) if start < self.body.len() => {
                let end = end.min(self.body.len() - 1);
                ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {}-{}/{}", start, end, self.body.len()).as_str(),
                    )
                    .set_body_bytes(&self.body[start..=end])
            }
            _ => ResponseTemplate::new(416),
        }
    }
}

#[tokio::test]
async fn test_concurrent_readers_get_correct_slices() {
    let body: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let server = MockServer::start().await;
    mock_list(&server, ".", &[dirent_json("big", false, 4096)]).await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .and(query_param("relPath", "./big"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;

    let core = Arc::new(core_for(&server));
    let (attr, _) = core.lookup(ROOT_INO, "big").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let core = Arc::clone(&core);
        let ino = attr.ino;
        tasks.push(tokio::spawn(async move {
            let fh = core
                .open(ino, OpenFlags::from_raw(libc::O_RDONLY))
                .await
                .unwrap();
            let offset = i * 512;
            let data = core.read(fh, offset, 512).await.unwrap();
            core.release(fh).await.unwrap();
            (offset, data)
        }));
    }

    for task in tasks {
        let (offset, data) = task.await.unwrap();
        let expected = &body[offset as usize..offset as usize + 512];
        assert_eq!(&data[..], expected, "range at offset {}", offset);
    }
}
