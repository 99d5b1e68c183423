//! Reference worker speaking the tether line protocol.
//!
//! Usage:
//!   tether-echo -oom <mb> -poll <secs> -tag <tag>
//!
//! Reads `<header> <body>` lines from stdin and answers on stdout, one JSON
//! object per line. Requests run concurrently, so replies may arrive out of
//! order. Methods:
//!
//!   ping, echo       reply with the body
//!   b64              `{"text": s}` -> `{"text": "base64:..."}`
//!   stream           `{"count": n}` -> n replies on one token, last has `done: true`
//!   sleep            `{"ms": n}` -> reply after n milliseconds
//!   fail             `{"message": s}` -> reply with error s
//!   silent           no reply
//!   noise            a garbage line and a stray token, then the body
//!   tag              reply carrying `{"tag": t}` as its tag
//!   pid              `{"pid": process id}`
//!   history          `{"methods": [...]}`, every method received so far, in order
//!   exit             `{"code": n}` -> exit without replying

use base64::Engine;
use serde_json::{json, Value};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;

struct Flags {
    oom: u64,
    poll_secs: u64,
    tag: String,
}

fn parse_flags() -> Result<Flags, String> {
    let mut flags = Flags {
        oom: 0,
        poll_secs: 30,
        tag: String::new(),
    };

    let mut args = std::env::args().skip(1);
    while let Some(name) = args.next() {
        let value = args
            .next()
            .ok_or_else(|| format!("flag needs an argument: {}", name))?;
        match name.as_str() {
            "-oom" => flags.oom = value.parse().map_err(|_| format!("bad -oom: {}", value))?,
            "-poll" => {
                flags.poll_secs = value.parse().map_err(|_| format!("bad -poll: {}", value))?
            }
            "-tag" => flags.tag = value,
            _ => return Err(format!("unknown flag: {}", name)),
        }
    }
    Ok(flags)
}

/// Split a request line into its header and body.
fn parse_request(line: &str) -> Option<(String, String, Value)> {
    let mut values = serde_json::Deserializer::from_str(line).into_iter::<Value>();
    let header = values.next()?.ok()?;
    let body = values.next().and_then(Result::ok).unwrap_or(Value::Null);

    let method = header.get("method")?.as_str()?.to_string();
    let token = header.get("token")?.as_str()?.to_string();
    Some((method, token, body))
}

fn response(token: &str, tag: &str, error: &str, data: Value) -> String {
    json!({ "token": token, "tag": tag, "error": error, "data": data }).to_string()
}

async fn handle(
    method: String,
    token: String,
    body: Value,
    tag: String,
    out: mpsc::UnboundedSender<String>,
) {
    let ok = |data: Value| response(&token, &tag, "", data);

    match method.as_str() {
        "ping" | "echo" => {
            let _ = out.send(ok(body));
        }
        "b64" => {
            let text = body.get("text").and_then(Value::as_str).unwrap_or_default();
            let encoded = base64::engine::general_purpose::STANDARD.encode(text);
            let _ = out.send(ok(json!({ "text": format!("base64:{}", encoded) })));
        }
        "stream" => {
            let count = body.get("count").and_then(Value::as_u64).unwrap_or(1);
            for i in 0..count {
                let _ = out.send(ok(json!({ "i": i, "done": i + 1 == count })));
            }
        }
        "sleep" => {
            let ms = body.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let _ = out.send(ok(json!({ "slept": ms })));
        }
        "fail" => {
            let message = body.get("message").and_then(Value::as_str).unwrap_or("failed");
            let _ = out.send(response(&token, &tag, message, json!({})));
        }
        "silent" => {}
        "noise" => {
            let _ = out.send("this is not json".to_string());
            let _ = out.send(response("stray.token", &tag, "", json!({})));
            let _ = out.send(ok(body));
        }
        "tag" => {
            let reply_tag = body.get("tag").and_then(Value::as_str).unwrap_or_default();
            let _ = out.send(response(&token, reply_tag, "", json!({})));
        }
        "pid" => {
            let _ = out.send(ok(json!({ "pid": std::process::id() })));
        }
        "exit" => {
            let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
            std::process::exit(code as i32);
        }
        other => {
            let message = format!("unknown method: {}", other);
            let _ = out.send(response(&token, &tag, &message, json!({})));
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let flags = match parse_flags() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("tether-echo: {}", e);
            return ExitCode::from(2);
        }
    };
    eprintln!(
        "tether-echo: started (oom={} poll={}s tag={:?})",
        flags.oom, flags.poll_secs, flags.tag
    );

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = BufWriter::new(tokio::io::stdout());
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut history: Vec<String> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("tether-echo: read error: {}", e);
                break;
            }
        };

        match parse_request(&line) {
            Some((method, token, body)) => {
                history.push(method.clone());
                if method == "history" {
                    let data = json!({ "methods": history });
                    let _ = out_tx.send(response(&token, &flags.tag, "", data));
                    continue;
                }
                tokio::spawn(handle(method, token, body, flags.tag.clone(), out_tx.clone()));
            }
            None if line.trim().is_empty() => {}
            None => eprintln!("tether-echo: bad request line: {:?}", line),
        }
    }

    // stdin closed: let in-flight replies drain, then exit
    drop(out_tx);
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    ExitCode::SUCCESS
}
