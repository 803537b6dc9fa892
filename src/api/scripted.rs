//! Purpose: Issue the three atomic server-side operations by digest, falling back to source.
//! Exports: `eval_atomic`, `set_and_publish`, `append`, `pop_front`.
//! Role: Scripted Operation Layer between the client and a `StoreConnection`.
//! Invariants: The digest form is always tried first; source is sent only after NOSCRIPT.
//! Invariants: Errors carry the tag they were issued for.
use crate::core::error::{ClientResult, Error, ErrorKind};
use crate::core::resp::RespValue;
use crate::core::scripts::{APPEND, POP_FRONT, SET_AND_PUBLISH, Script};
use crate::transport::StoreConnection;
use serde_json::Value;
use tracing::debug;

pub async fn eval_atomic<S: StoreConnection>(
    conn: &mut S,
    script: &Script,
    keys: &[&str],
    args: &[&str],
) -> ClientResult<RespValue> {
    match conn.eval_sha(script.digest(), keys, args).await {
        Err(err) if err.is_no_script() => {
            debug!(script = script.name(), "script not cached by server; sending source");
            conn.eval(script.source(), keys, args).await
        }
        result => result,
    }
}

/// Store the last of `values` and publish the whole batch.
pub async fn set_and_publish<S: StoreConnection>(
    conn: &mut S,
    project: &str,
    tag: &str,
    values: &[String],
) -> ClientResult<()> {
    let Some(latest) = values.last() else {
        return Err(Error::new(ErrorKind::Internal)
            .with_message("empty write batch")
            .with_tag(tag));
    };
    let batch = Value::from(values.to_vec()).to_string();
    eval_atomic(conn, &SET_AND_PUBLISH, &[tag], &[latest.as_str(), batch.as_str(), project])
        .await
        .map(|_| ())
        .map_err(|err| err.with_tag(tag))
}

/// Returns the list after the append, JSON-encoded.
pub async fn append<S: StoreConnection>(
    conn: &mut S,
    project: &str,
    tag: &str,
    encoded_item: &str,
) -> ClientResult<String> {
    let reply = eval_atomic(conn, &APPEND, &[tag], &[encoded_item, project])
        .await
        .map_err(|err| err.with_tag(tag))?;
    text_reply(reply, tag)
}

/// Returns the removed element, JSON-encoded.
pub async fn pop_front<S: StoreConnection>(
    conn: &mut S,
    project: &str,
    tag: &str,
) -> ClientResult<String> {
    let reply = eval_atomic(conn, &POP_FRONT, &[tag], &[project])
        .await
        .map_err(|err| err.with_tag(tag))?;
    text_reply(reply, tag)
}

fn text_reply(reply: RespValue, tag: &str) -> ClientResult<String> {
    reply.as_text().ok_or_else(|| {
        Error::new(ErrorKind::Protocol)
            .with_message(format!("script returned a non-text reply: {reply:?}"))
            .with_tag(tag)
    })
}

#[cfg(test)]
mod tests {
    use super::{append, pop_front, set_and_publish};
    use crate::core::error::ErrorKind;
    use crate::core::scripts::SET_AND_PUBLISH;
    use crate::transport::{Connector, Endpoint, MemoryStore};

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "memory".to_string(),
            port: 1,
            tls: false,
        }
    }

    #[tokio::test]
    async fn falls_back_to_source_once_then_uses_digest() {
        let store = MemoryStore::new();
        let mut conn = store.connector().connect(&endpoint()).await.expect("connect");
        let values = vec!["\"a\"".to_string(), "\"b\"".to_string()];
        set_and_publish(&mut conn, "p", "x", &values).await.expect("first");
        set_and_publish(&mut conn, "p", "x", &values).await.expect("second");

        let calls = store.script_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].script, SET_AND_PUBLISH.name());
        assert_eq!(calls[0].args, vec!["\"b\"", r#"["\"a\"","\"b\""]"#, "p"]);
        assert_eq!(store.value("p:x").as_deref(), Some("\"b\""));
    }

    #[tokio::test]
    async fn list_operations_return_encoded_text() {
        let store = MemoryStore::new();
        let mut conn = store.connector().connect(&endpoint()).await.expect("connect");
        assert_eq!(append(&mut conn, "p", "l", "\"a\"").await.expect("append"), r#"["a"]"#);
        assert_eq!(pop_front(&mut conn, "p", "l").await.expect("pop"), "\"a\"");

        let err = pop_front(&mut conn, "p", "missing").await.expect_err("absent");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.tag(), Some("missing"));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_locally() {
        let store = MemoryStore::new();
        let mut conn = store.connector().connect(&endpoint()).await.expect("connect");
        let err = set_and_publish(&mut conn, "p", "x", &[]).await.expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(store.script_calls().is_empty());
    }
}
