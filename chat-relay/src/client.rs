use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde_json::Value;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    connection::UNKNOWN,
    message::{ChatMessage, Control, timestamp},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;
type SocketStream = SplitStream<Socket>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut sink, mut stream) = establish_connection(&args).await?;
    send_join(&mut sink, &args.name).await?;
    write_stdout(&format!("*** connected as {}", args.name)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut typing = HashSet::new();

    run_client_loop(
        &mut stream,
        &mut sink,
        &mut stdin,
        &mut input,
        &mut typing,
        &args.name,
    )
    .await?;
    shutdown_connection(&mut sink).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(SocketSink, SocketStream)> {
    let (socket, _) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(socket.split())
}

async fn send_join(sink: &mut SocketSink, name: &str) -> Result<()> {
    let join = Control::Join {
        user: name.to_string(),
        time: timestamp(Utc::now()),
    };
    sink.send(Message::Text(serde_json::to_string(&join)?)).await?;
    Ok(())
}

async fn run_client_loop(
    stream: &mut SocketStream,
    sink: &mut SocketSink,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    typing: &mut HashSet<String>,
    name: &str,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = stream.next() => {
                if !handle_server_message(server_message, typing).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, sink, name).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    typing: &mut HashSet<String>,
) -> Result<bool> {
    let line = match message.transpose()? {
        Some(Message::Text(text)) => render_text(&text, typing),
        Some(Message::Binary(bytes)) => {
            Some(format!("*** received {} bytes of binary data", bytes.len()))
        }
        Some(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Some(Message::Close(_)) | None => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    };

    if let Some(line) = line {
        write_stdout(&line).await?;
    }
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    sink: &mut SocketSink,
    name: &str,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let chat = ChatMessage::new(name, text, Utc::now());
    sink.send(Message::Text(serde_json::to_string(&chat)?)).await?;
    Ok(true)
}

/// Turns one relayed text frame into a terminal line. Typing notices only
/// print when a user starts or stops typing.
fn render_text(text: &str, typing: &mut HashSet<String>) -> Option<String> {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(text) else {
        return Some(text.to_string());
    };

    let user = fields
        .get("user")
        .and_then(Value::as_str)
        .filter(|user| !user.is_empty())
        .unwrap_or(UNKNOWN);

    if fields.get("type").and_then(Value::as_str) == Some("typing") {
        let active = fields.get("typing").and_then(Value::as_bool).unwrap_or(false);
        return match (active, typing.contains(user)) {
            (true, false) => {
                typing.insert(user.to_string());
                Some(format!("*** {user} is typing"))
            }
            (false, true) => {
                typing.remove(user);
                Some(format!("*** {user} stopped typing"))
            }
            _ => None,
        };
    }

    match fields.get("text").and_then(Value::as_str) {
        Some(body) => {
            typing.remove(user);
            Some(format!("<{user}> {body}"))
        }
        None => Some(text.to_string()),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(sink: &mut SocketSink) {
    if let Err(error) = sink.close().await {
        warn!(?error, "failed to close websocket cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
