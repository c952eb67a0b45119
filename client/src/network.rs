//! Client side of the relay connection

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Connects to `url` and chats until the relay closes the connection
///
/// Lines read from `input` are sent as text frames; blank lines are skipped.
/// When `input` ends, a close frame is sent and any remaining frames are
/// still written to `output` until the relay hangs up.
pub async fn run<R, W>(url: &str, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (socket, _) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {}", url))?;
    info!("Connected to {}", url);

    let (mut sink, mut stream) = socket.split();
    let mut lines = input.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line.context("failed to read input")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => sink.send(Message::Text(line.into())).await?,
                    None => {
                        debug!("Input closed, closing connection");
                        input_open = false;
                        sink.close().await?;
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(msg)) => {
                    if let Some(line) = render(&msg) {
                        output.write_all(line.as_bytes()).await?;
                        output.write_all(b"\n").await?;
                        output.flush().await?;
                    }
                }
                Some(Err(e)) => {
                    debug!("Connection error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    info!("Disconnected from {}", url);
    Ok(())
}

/// Turns a relayed frame into a printable line, if it carries a message
pub fn render(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.as_str().to_owned()),
        Message::Binary(data) => Some(format!("<{} bytes of binary data>", data.len())),
        _ => None,
    }
}
