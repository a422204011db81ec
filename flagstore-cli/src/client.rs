use flagstore_lib::proto::{
    storage_request_message, storage_return_message, StorageRequestMessage,
    StorageRequestMessages, StorageReturnMessages,
};
use prost::Message;
use tokio::net::UnixStream;

use crate::server::{read_frame, write_frame};

/// Sends one batch to the daemon and waits for its responses.
pub async fn send_batch(
    socket_path: &str,
    msgs: Vec<storage_request_message::Msg>,
) -> Result<Vec<storage_return_message::Msg>, String> {
    let requests = StorageRequestMessages {
        msgs: msgs.into_iter().map(StorageRequestMessage::from_msg).collect(),
    };

    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| format!("Failed to connect to {}: {}", socket_path, e))?;
    write_frame(&mut stream, &requests.encode_to_vec())
        .await
        .map_err(|e| format!("Failed to send request: {}", e))?;
    let frame = read_frame(&mut stream)
        .await
        .map_err(|e| format!("Failed to read response: {}", e))?
        .ok_or_else(|| "Daemon closed the connection without responding".to_string())?;
    let returns = StorageReturnMessages::decode(frame.as_slice())
        .map_err(|e| format!("Failed to decode response: {}", e))?;

    if returns.msgs.len() != requests.msgs.len() {
        return Err(format!(
            "Expected {} responses, got {}",
            requests.msgs.len(),
            returns.msgs.len()
        ));
    }
    returns
        .msgs
        .into_iter()
        .map(|ret| match ret.msg {
            Some(storage_return_message::Msg::ErrorMessage(e)) => Err(e),
            Some(msg) => Ok(msg),
            None => Err("Empty response".to_string()),
        })
        .collect()
}

/// Sends a single request and returns its response.
pub async fn send(
    socket_path: &str,
    msg: storage_request_message::Msg,
) -> Result<storage_return_message::Msg, String> {
    send_batch(socket_path, vec![msg])
        .await?
        .pop()
        .ok_or_else(|| "Empty response".to_string())
}

/// Splits `package.flag` at the last dot.
pub fn split_flag(qualified: &str) -> Result<(&str, &str), String> {
    match qualified.rsplit_once('.') {
        Some((package, flag)) if !package.is_empty() && !flag.is_empty() => Ok((package, flag)),
        _ => Err(format!(
            "Expected <package>.<flag>, got {:?}",
            qualified
        )),
    }
}
