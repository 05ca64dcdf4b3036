//! `http`: make an HTTP request
//!
//! Usage: `http [--method M] [--header 'Name: value']... URL`
//!
//! Input items, if any, are sent as a JSON array body. The response body
//! becomes a single item: parsed JSON when it is JSON, plain text otherwise.

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use super::{item_stream, ItemStream, StageContext, StageHandler, StageOutput};
use crate::{Error, Result};

pub struct HttpHandler {
    client: reqwest::Client,
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

struct HttpArgs {
    method: Method,
    headers: Vec<(HeaderName, HeaderValue)>,
    url: String,
}

fn parse_args(ctx: &StageContext) -> Result<HttpArgs> {
    let mut method = None;
    let mut headers = Vec::new();
    let mut url = None;

    let mut args = ctx.args().iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--method" | "-X" => {
                let value = args.next().ok_or_else(|| ctx.error("--method needs a value"))?;
                method = Some(
                    Method::from_bytes(value.to_uppercase().as_bytes())
                        .map_err(|_| ctx.error(format!("invalid method {}", value)))?,
                );
            }
            "--header" | "-H" => {
                let value = args.next().ok_or_else(|| ctx.error("--header needs a value"))?;
                let (name, val) = value
                    .split_once(':')
                    .ok_or_else(|| ctx.error(format!("header must be 'Name: value', got {}", value)))?;
                let name = HeaderName::from_bytes(name.trim().as_bytes())
                    .map_err(|e| ctx.error(format!("bad header name: {}", e)))?;
                let val = HeaderValue::from_str(val.trim())
                    .map_err(|e| ctx.error(format!("bad header value: {}", e)))?;
                headers.push((name, val));
            }
            flag if flag.starts_with('-') => {
                return Err(ctx.error(format!("unknown flag {}", flag)));
            }
            _ if url.is_some() => {
                return Err(ctx.error(format!("unexpected argument {}", arg)));
            }
            _ => url = Some(arg.clone()),
        }
    }

    let url = url.ok_or_else(|| ctx.error("missing URL"))?;
    let method = method.unwrap_or(if ctx.has_input {
        Method::POST
    } else {
        Method::GET
    });
    Ok(HttpArgs {
        method,
        headers,
        url,
    })
}

#[async_trait]
impl StageHandler for HttpHandler {
    async fn execute(&self, ctx: &StageContext, input: ItemStream) -> Result<StageOutput> {
        let args = parse_args(ctx)?;
        debug!("HTTP {} {}", args.method, args.url);

        let mut request = self.client.request(args.method.clone(), &args.url);
        for (name, value) in args.headers {
            request = request.header(name, value);
        }
        if ctx.has_input {
            let body: Vec<Value> = input.try_collect().await?;
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(Error::HandlerExecution(format!(
                "http: {} {} returned {}: {}",
                args.method,
                args.url,
                status,
                text.trim()
            )));
        }

        let item = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(StageOutput::Items(item_stream(vec![item])))
    }

    fn usage(&self) -> &str {
        "http [--method M] [--header 'K: V']... URL  request a URL, one item with the body"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::run;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn handler() -> HttpHandler {
        HttpHandler {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
        }
    }

    /// Serve one canned response and hand back the raw request
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Read headers plus whatever body arrives with them
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if n == 0 || body_complete(&text) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    fn body_complete(request: &str) -> bool {
        let Some((head, body)) = request.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    #[tokio::test]
    async fn test_get_parses_json_body() {
        let (url, server) = serve_once("200 OK", r#"{"ok": true}"#).await;
        let items = run(&handler(), &format!("http {}", url), None)
            .await
            .unwrap();
        assert_eq!(items, vec![json!({"ok": true})]);
        assert!(server.await.unwrap().starts_with("GET / "));
    }

    #[tokio::test]
    async fn test_input_is_posted_as_json_array() {
        let (url, server) = serve_once("200 OK", "thanks").await;
        let line = format!("http --header 'X-Token: abc' {}", url);
        let items = run(&handler(), &line, Some(vec![json!({"a": 1})]))
            .await
            .unwrap();
        assert_eq!(items, vec![json!("thanks")]);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST / "));
        assert!(request.to_lowercase().contains("x-token: abc"));
        assert!(request.ends_with(r#"[{"a":1}]"#));
    }

    #[tokio::test]
    async fn test_error_status_fails_stage() {
        let (url, _server) = serve_once("500 Internal Server Error", "boom").await;
        let err = run(&handler(), &format!("http {}", url), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let handler = handler();
        assert!(run(&handler, "http", None).await.is_err());
        assert!(run(&handler, "http --header nocolon http://x", None).await.is_err());
        assert!(run(&handler, "http --bogus http://x", None).await.is_err());
    }
}
