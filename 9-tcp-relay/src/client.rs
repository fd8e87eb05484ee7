use std::path::Path;

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::{
    fs::File,
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{
        FrameReader, FrameWriter, ServerToClient, TRANSFER_COMPLETE, frame_reader, frame_writer,
        read_frame, write_frame,
    },
};

/// Size of the data frames used when sending a file.
const UPLOAD_CHUNK: usize = 64 * 1024;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    send_handshake(&mut writer, &args.username).await?;
    await_welcome(&mut reader, &args.username).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((frame_reader(reader), frame_writer(writer)))
}

async fn send_handshake(writer: &mut FrameWriter<OwnedWriteHalf>, username: &str) -> Result<()> {
    write_frame(writer, Bytes::copy_from_slice(username.as_bytes())).await?;
    Ok(())
}

async fn await_welcome(reader: &mut FrameReader<OwnedReadHalf>, username: &str) -> Result<()> {
    let Some(reply) = read_frame(reader).await? else {
        bail!("server closed the connection during the handshake");
    };

    if reply[..] == ServerToClient::Welcome.encode()[..] {
        write_stdout(&format!("*** connected as {username}")).await?;
        return Ok(());
    }

    let text = String::from_utf8_lossy(&reply);
    write_stderr(&format!("!!! {text}")).await?;
    bail!("server refused the connection: {text}");
}

async fn run_client_loop(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_frame = read_frame(reader) => {
                if !handle_server_frame(server_frame).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, reader, writer).await? {
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

async fn handle_server_frame(frame: io::Result<Option<BytesMut>>) -> Result<bool> {
    match frame? {
        Some(frame) => {
            render_server_frame(&frame).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(rest) = text.strip_prefix("/send ") {
        return match rest.trim().split_once(char::is_whitespace) {
            Some((recipient, path)) => {
                send_file(reader, writer, recipient, Path::new(path.trim())).await
            }
            None => {
                write_stderr("!!! usage: /send <recipient> <path>").await?;
                Ok(true)
            }
        };
    }

    write_frame(writer, Bytes::copy_from_slice(text.as_bytes())).await?;
    Ok(true)
}

/// Streams a file as a `file:` command, data frames and an empty terminator,
/// then waits for the server's acknowledgment. Returns false if the server
/// went away first.
async fn send_file(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
    recipient: &str,
    path: &Path,
) -> Result<bool> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            write_stderr(&format!("!!! cannot read {}: {err}", path.display())).await?;
            return Ok(true);
        }
    };
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());

    write_frame(writer, Bytes::from(format!("file:{recipient}:{filename}"))).await?;

    let mut buffer = vec![0u8; UPLOAD_CHUNK];
    let mut sent = 0u64;
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];
        if chunk == TRANSFER_COMPLETE {
            // A chunk equal to the legacy marker would end the transfer early.
            write_frame(writer, Bytes::copy_from_slice(&chunk[..1])).await?;
            write_frame(writer, Bytes::copy_from_slice(&chunk[1..])).await?;
        } else {
            write_frame(writer, Bytes::copy_from_slice(chunk)).await?;
        }
        sent += read as u64;
    }
    write_frame(writer, Bytes::new()).await?;

    write_stdout(&format!("*** sent {sent} bytes of {filename} to {recipient}")).await?;
    await_transfer_ack(reader).await
}

/// Prints server frames until the transfer acknowledgment arrives.
async fn await_transfer_ack(reader: &mut FrameReader<OwnedReadHalf>) -> Result<bool> {
    loop {
        let Some(frame) = read_frame(reader).await? else {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        };
        render_server_frame(&frame).await?;
        if frame[..] == *TRANSFER_COMPLETE {
            return Ok(true);
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut FrameWriter<OwnedWriteHalf>) {
    if let Err(error) = SinkExt::<Bytes>::close(writer).await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_server_frame(frame: &[u8]) -> io::Result<()> {
    if frame == TRANSFER_COMPLETE {
        return write_stdout("*** file transfer complete").await;
    }

    match std::str::from_utf8(frame) {
        Ok(text) => match text.strip_prefix("file:").and_then(|rest| rest.split_once(':')) {
            Some((sender, filename)) => {
                write_stdout(&format!("*** {sender} is sending you {filename}")).await
            }
            None => write_stdout(text).await,
        },
        Err(_) => write_stdout(&format!("*** received {} bytes of binary data", frame.len())).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
