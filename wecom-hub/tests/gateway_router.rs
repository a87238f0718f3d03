use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde::Deserialize;
use tower::ServiceExt;

use wecom_hub::gateway::dispatcher::UNROUTABLE_REPLY;
use wecom_hub::gateway::router;
use wecom_hub::wecom::{InstanceReply, MemorySender, MsgCrypt};
use wecom_hub::{HubApp, HubConfig};

const KEY_A: &str = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C";
const KEY_B: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

const CONFIG: &str = r#"
[server]
bind_addr = "127.0.0.1:0"

[wecom]
corp_id = "ww-corp"

[[wecom.apps]]
app_id = "alpha"
agent_id = 1000001
corp_secret = "secret-a"
token = "token-a"
encoding_aes_key = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C"
url_prefix = "https://hooks.example.com/alpha"

[[wecom.apps]]
app_id = "beta"
agent_id = 1000002
corp_secret = "secret-b"
token = "token-b"
encoding_aes_key = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG"
"#;

#[derive(Deserialize)]
struct SealedReply {
    #[serde(rename = "Encrypt")]
    encrypt: String,
    #[serde(rename = "MsgSignature")]
    signature: String,
    #[serde(rename = "TimeStamp")]
    timestamp: String,
    #[serde(rename = "Nonce")]
    nonce: String,
}

fn app() -> HubApp {
    let config = HubConfig::from_toml_str(CONFIG).unwrap();
    HubApp::build_with_sender(config, Arc::new(MemorySender::new())).unwrap()
}

fn query(pairs: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}

fn text_xml(agent_id: u64, content: &str) -> String {
    format!(
        "<xml><ToUserName><![CDATA[ww-corp]]></ToUserName><FromUserName><![CDATA[bob]]></FromUserName><CreateTime>1700000000</CreateTime><MsgType><![CDATA[text]]></MsgType><Content><![CDATA[{content}]]></Content><MsgId>7</MsgId><AgentID>{agent_id}</AgentID></xml>"
    )
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn open_reply(crypt: &MsgCrypt, body: &str) -> InstanceReply {
    let sealed: SealedReply = quick_xml::de::from_str(body).unwrap();
    let envelope = format!("<xml><Encrypt><![CDATA[{}]]></Encrypt></xml>", sealed.encrypt);
    let xml = crypt
        .decrypt_message(&sealed.signature, &sealed.timestamp, &sealed.nonce, &envelope)
        .unwrap();
    InstanceReply::from_xml(&xml).unwrap()
}

#[tokio::test]
async fn test_health_lists_configured_apps() {
    let app = app();
    let response = router(app.state())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["feed"], false);
    let mut apps: Vec<String> = serde_json::from_value(json["apps"].clone()).unwrap();
    apps.sort();
    assert_eq!(apps, vec!["alpha".to_string(), "beta".to_string()]);
}

#[tokio::test]
async fn test_url_verification_echoes_plaintext() {
    let app = app();
    let crypt = MsgCrypt::new("token-a", KEY_A, "ww-corp").unwrap();
    let sealed = crypt.seal("echo-1234", "1700000000", "nonce").unwrap();
    let uri = format!(
        "/?{}",
        query(&[
            ("msg_signature", sealed.signature.as_str()),
            ("timestamp", "1700000000"),
            ("nonce", "nonce"),
            ("echostr", sealed.encrypt.as_str()),
        ])
    );

    let response = router(app.state())
        .oneshot(
            Request::get(&uri)
                .header("x-app-id", "alpha")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "echo-1234");
}

#[tokio::test]
async fn test_url_verification_failure_reports_code() {
    let app = app();
    let crypt = MsgCrypt::new("token-a", KEY_A, "ww-corp").unwrap();
    let sealed = crypt.seal("echo", "1", "n").unwrap();
    let uri = format!(
        "/?{}",
        query(&[
            ("msg_signature", "0000"),
            ("timestamp", "1"),
            ("nonce", "n"),
            ("echostr", sealed.encrypt.as_str()),
        ])
    );

    let response = router(app.state())
        .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "VERIFY_URL ERR: VERIFY_FAIL: -40001");
}

#[tokio::test]
async fn test_verification_without_echostr_is_still_200() {
    let app = app();
    let uri = format!(
        "/?{}",
        query(&[("msg_signature", "a"), ("timestamp", "1"), ("nonce", "n")])
    );
    let response = router(app.state())
        .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "VERIFY_URL ERR: VERIFY_FAIL: -40001");
}

#[tokio::test]
async fn test_delivery_without_query_is_still_200() {
    let app = app();
    let crypt = MsgCrypt::new("token-a", KEY_A, "ww-corp").unwrap();
    let sealed = crypt.seal(&text_xml(1000001, "hello"), "1", "n").unwrap();
    let response = router(app.state())
        .oneshot(
            Request::post("/")
                .header("x-app-id", "alpha")
                .body(Body::from(sealed.xml))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "RECEIVE_MESSAGE ERR: DECRYPT_FAIL: -40001"
    );
}

#[tokio::test]
async fn test_delivery_selected_by_upstream_and_deduplicated() {
    let app = app();
    let crypt = MsgCrypt::new("token-b", KEY_B, "ww-corp").unwrap();
    let sealed = crypt.seal(&text_xml(1000002, "hello"), "1700000000", "abc").unwrap();
    let uri = format!(
        "/?{}",
        query(&[
            ("msg_signature", sealed.signature.as_str()),
            ("timestamp", "1700000000"),
            ("nonce", "abc"),
        ])
    );
    let request = || {
        Request::post(&uri)
            .header("x-app-id", "beta")
            .body(Body::from(sealed.xml.clone()))
            .unwrap()
    };

    let router = router(app.state());
    let first = router.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_string(first).await;
    let reply = open_reply(&crypt, &first_body);
    assert_eq!(reply.content, UNROUTABLE_REPLY);
    assert_eq!(reply.to_user_name, "bob");

    // A retry gets the same sealed reply, in case the first one was lost.
    let second = router.oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_string(second).await, first_body);
}

#[tokio::test]
async fn test_wrong_application_key_is_rejected() {
    let app = app();
    // Sealed for beta, but the upstream header routes it to alpha.
    let crypt = MsgCrypt::new("token-b", KEY_B, "ww-corp").unwrap();
    let sealed = crypt.seal(&text_xml(1000002, "hello"), "1", "n").unwrap();
    let uri = format!(
        "/?{}",
        query(&[
            ("msg_signature", sealed.signature.as_str()),
            ("timestamp", "1"),
            ("nonce", "n"),
        ])
    );

    let response = router(app.state())
        .oneshot(
            Request::post(&uri)
                .header("x-upstream", "https://HOOKS.example.com/alpha/callback")
                .body(Body::from(sealed.xml))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "RECEIVE_MESSAGE ERR: DECRYPT_FAIL: -40001"
    );
}

#[tokio::test]
async fn test_feed_add_without_feed_is_not_found() {
    let app = app();
    let response = router(app.state())
        .oneshot(
            Request::get("/feed/add?episode_id=0a1b")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_check_and_jobs_on_minimal_app() {
    let app = app();
    app.check().unwrap();
    app.start_jobs().unwrap();
    assert_eq!(app.scheduler().job_names(), vec!["dedup-purge".to_string()]);
    app.shutdown().await;
    assert_eq!(app.scheduler().live_timers(), 0);
}

const TORRENT_APP: &str = r#"
[[wecom.apps]]
app_id = "torrent"
agent_id = 1000010
corp_secret = "secret-t"
token = "token-t"
encoding_aes_key = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C"
handler = "torrent"
"#;

#[tokio::test]
async fn test_torrent_app_needs_a_torrent_section() {
    let raw = format!("{}{}", CONFIG, TORRENT_APP);
    let config = HubConfig::from_toml_str(&raw).unwrap();
    let app = HubApp::build_with_sender(config, Arc::new(MemorySender::new())).unwrap();
    let err = app.check().unwrap_err();
    assert!(err.to_string().contains("[torrent]"));
    app.shutdown().await;

    let raw = format!(
        "{}{}\n[torrent]\nurl = \"http://127.0.0.1:8080\"\nusername = \"admin\"\npassword = \"pw\"\n",
        CONFIG, TORRENT_APP
    );
    let config = HubConfig::from_toml_str(&raw).unwrap();
    let app = HubApp::build_with_sender(config, Arc::new(MemorySender::new())).unwrap();
    app.check().unwrap();
    app.shutdown().await;
}
