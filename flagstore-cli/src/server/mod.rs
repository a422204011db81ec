mod config;
pub mod handler;
pub mod manager;
pub mod storage_files;

use std::future::Future;
use std::io;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use flagstore_lib::proto::{StorageRequestMessages, StorageReturnMessage, StorageReturnMessages};
use log::{debug, error, info, warn};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

pub use self::config::{DaemonConfig, FlagstoreConfig};
use self::handler::FlagDaemon;

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one length-prefixed frame. `None` means the peer closed the
/// connection between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {} byte limit", len, MAX_FRAME_LEN),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {} byte limit", payload.len(), MAX_FRAME_LEN),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Runs every message of a batch on the blocking pool, one at a time, so
/// responses keep request order.
async fn process_batch(
    daemon: &Arc<FlagDaemon>,
    requests: StorageRequestMessages,
    timeout: Duration,
) -> StorageReturnMessages {
    let mut msgs = Vec::with_capacity(requests.msgs.len());
    for request in requests.msgs {
        let daemon = Arc::clone(daemon);
        let task = tokio::task::spawn_blocking(move || daemon.handle_request(request));
        let ret = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(ret)) => ret,
            Ok(Err(e)) => StorageReturnMessage::error(format!("failed to handle request: {}", e)),
            Err(_) => {
                warn!("request timed out after {:?}", timeout);
                StorageReturnMessage::error(format!(
                    "failed to handle request: timed out after {:?}",
                    timeout
                ))
            }
        };
        msgs.push(ret);
    }
    StorageReturnMessages { msgs }
}

pub async fn handle_connection(
    daemon: Arc<FlagDaemon>,
    stream: UnixStream,
    timeout: Duration,
) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    while let Some(frame) = read_frame(&mut reader).await? {
        let returns = match StorageRequestMessages::decode(frame.as_slice()) {
            Ok(requests) => {
                debug!("received batch of {} requests", requests.msgs.len());
                process_batch(&daemon, requests, timeout).await
            }
            Err(e) => StorageReturnMessages {
                msgs: vec![StorageReturnMessage::error(format!(
                    "failed to decode request: {}",
                    e
                ))],
            },
        };
        write_frame(&mut writer, &returns.encode_to_vec()).await?;
    }
    Ok(())
}

/// Accepts connections until `shutdown` resolves.
pub async fn serve_listener(
    daemon: Arc<FlagDaemon>,
    listener: UnixListener,
    timeout: Duration,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let daemon = Arc::clone(&daemon);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(daemon, stream, timeout).await {
                            warn!("connection closed with error: {}", e);
                        }
                    });
                }
                Err(e) => error!("failed to accept connection: {}", e),
            },
        }
    }
}

fn open_daemon(config: &DaemonConfig) -> FlagDaemon {
    FlagDaemon::open(config).unwrap_or_else(|e| {
        eprintln!("Failed to open flag storage at {}: {}", config.root_dir, e);
        process::exit(1);
    })
}

pub async fn run_serve(config: DaemonConfig) {
    let daemon = Arc::new(open_daemon(&config));

    let socket_path = Path::new(&config.socket_path);
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            eprintln!("Failed to remove stale socket {}: {}", config.socket_path, e);
            process::exit(1);
        }
    }
    let listener = UnixListener::bind(socket_path).unwrap_or_else(|e| {
        eprintln!("Failed to bind to {}: {}", config.socket_path, e);
        process::exit(1);
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }

        #[cfg(not(unix))]
        ctrl_c.await.ok();

        println!("Shutdown signal received, closing socket...");
    };

    println!(
        "Serving flag storage from {} on {}",
        config.root_dir, config.socket_path
    );
    info!("request timeout {:?}", config.request_timeout());
    serve_listener(daemon, listener, config.request_timeout(), shutdown).await;

    let _ = std::fs::remove_file(socket_path);
    println!("Server stopped");
}

/// Boot-time pass run once before the daemon starts serving.
pub fn run_init(config: DaemonConfig) {
    let daemon = open_daemon(&config);
    match daemon.initialize(config.build_id.as_deref()) {
        Ok(count) => println!(
            "Initialized boot storage for {} containers in {}",
            count, config.root_dir
        ),
        Err(e) => {
            eprintln!("Failed to initialize boot storage: {}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagstore_lib::proto::{
        storage_request_message, storage_return_message, FlagQueryMessage, ListStorageMessage,
        list_storage_message, StorageRequestMessage,
    };

    fn daemon(root: &Path) -> Arc<FlagDaemon> {
        std::fs::create_dir_all(root).unwrap();
        let config = DaemonConfig {
            root_dir: root.display().to_string(),
            ..DaemonConfig::default()
        };
        Arc::new(FlagDaemon::open(&config).unwrap())
    }

    #[tokio::test]
    async fn test_frame_limit() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        let err = read_frame(&mut frame.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(&dir.path().join("root"));
        let socket = dir.path().join("flagstore.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_listener(
            daemon,
            listener,
            Duration::from_secs(5),
            async move {
                stopped.await.ok();
            },
        ));

        let requests = StorageRequestMessages {
            msgs: vec![
                StorageRequestMessage::from_msg(storage_request_message::Msg::ListStorageMessage(
                    ListStorageMessage {
                        msg: Some(list_storage_message::Msg::All(true)),
                    },
                )),
                StorageRequestMessage::from_msg(storage_request_message::Msg::FlagQueryMessage(
                    FlagQueryMessage {
                        package_name: "pkg.a".into(),
                        flag_name: "f1".into(),
                    },
                )),
            ],
        };
        let mut stream = UnixStream::connect(&socket).await.unwrap();
        write_frame(&mut stream, &requests.encode_to_vec()).await.unwrap();
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        let returns = StorageReturnMessages::decode(frame.as_slice()).unwrap();

        assert_eq!(returns.msgs.len(), 2);
        match &returns.msgs[0].msg {
            Some(storage_return_message::Msg::ListStorageMessage(list)) => {
                assert!(list.flags.is_empty())
            }
            _ => panic!("expected a list response"),
        }
        assert!(returns.msgs[1]
            .error_message()
            .unwrap()
            .contains("ERROR_PACKAGE_NOT_FOUND"));

        stop.send(()).unwrap();
        server.await.unwrap();
    }
}
