//! Thin conformance harness: uploads a local file to a running server and
//! pulls it back, verifying the round trip byte-for-byte. Not part of the
//! server's core; a standalone client exercising the wire protocol from the
//! outside.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about = "Round-trip conformance check for audio-cache-server")]
struct Args {
    /// Server WebSocket URL, e.g. ws://127.0.0.1:8080/audio
    #[arg(long, default_value = "ws://127.0.0.1:8080/audio")]
    url: String,

    /// Local file to upload and read back.
    #[arg(long)]
    file: PathBuf,

    /// Stream id to use for the round trip.
    #[arg(long, default_value = "harness-roundtrip")]
    stream_id: String,

    /// Upload chunk size, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,

    /// GET read-back chunk size, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    read_size: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args).await {
        Ok(()) => {
            println!("PASS: {} round-tripped {} bytes correctly", args.stream_id, args.file.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("FAIL: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let original = std::fs::read(&args.file)?;

    let (ws, _) = tokio_tungstenite::connect_async(args.url.as_str()).await?;
    let (mut write, mut read) = ws.split();

    send_control(&mut write, json!({ "type": "START", "streamId": args.stream_id })).await?;
    expect_kind(&mut read, "STARTED").await?;

    for chunk in original.chunks(args.chunk_size.max(1)) {
        write.send(Message::Binary(chunk.to_vec())).await?;
    }

    send_control(&mut write, json!({ "type": "STOP", "streamId": args.stream_id })).await?;
    expect_kind(&mut read, "STOPPED").await?;

    let mut pulled = Vec::with_capacity(original.len());
    while (pulled.len() as u64) < original.len() as u64 {
        let offset = pulled.len() as u64;
        send_control(
            &mut write,
            json!({
                "type": "GET",
                "streamId": args.stream_id,
                "offset": offset,
                "length": args.read_size,
            }),
        )
        .await?;

        match read.next().await {
            Some(Ok(Message::Binary(data))) => {
                if data.is_empty() {
                    return Err("server returned an empty GET response before the file was fully read back".into());
                }
                pulled.extend_from_slice(&data);
            }
            Some(Ok(Message::Text(text))) => {
                return Err(format!("expected a binary GET response, got: {text}").into());
            }
            Some(Ok(other)) => return Err(format!("unexpected frame: {other:?}").into()),
            Some(Err(e)) => return Err(e.into()),
            None => return Err("connection closed before read-back completed".into()),
        }
    }

    let _ = write.close().await;

    if pulled != original {
        return Err(format!(
            "round trip mismatch: uploaded {} bytes, read back {} bytes that do not match",
            original.len(),
            pulled.len()
        )
        .into());
    }

    Ok(())
}

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn send_control(write: &mut WsWrite, value: Value) -> Result<(), Box<dyn std::error::Error>> {
    write.send(Message::Text(value.to_string())).await?;
    Ok(())
}

async fn expect_kind(read: &mut WsRead, expected: &str) -> Result<(), Box<dyn std::error::Error>> {
    match read.next().await {
        Some(Ok(Message::Text(text))) => {
            let value: Value = serde_json::from_str(&text)?;
            let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
            if kind == expected {
                Ok(())
            } else {
                Err(format!("expected {expected}, got: {text}").into())
            }
        }
        Some(Ok(other)) => Err(format!("expected a text control frame, got: {other:?}").into()),
        Some(Err(e)) => Err(e.into()),
        None => Err("connection closed while waiting for a control response".into()),
    }
}
