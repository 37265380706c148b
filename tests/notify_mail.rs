use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use access_fulfillment::config::MailSettings;
use access_fulfillment::notify::{GrantNotice, HttpMailer, NotificationDispatcher, RevokeNotice};

fn dispatcher(server: &MockServer) -> NotificationDispatcher {
    let settings = MailSettings {
        api_url: format!("{}/v1/send", server.uri()),
        api_key: "mail-key".into(),
        from: "tickets@example.com".into(),
    };
    NotificationDispatcher::new(
        Arc::new(HttpMailer::new(&settings)),
        settings.from.clone(),
        Duration::from_secs(5),
    )
    .expect("templates")
}

fn grant_notice() -> GrantNotice {
    GrantNotice {
        display_name: Some("Ada".into()),
        product_id: "501".into(),
        product_title: Some("Backstage Pass".into()),
        order_id: "1001".into(),
        token: "header.payload.signature".into(),
        expires_at: Utc::now(),
    }
}

#[tokio::test]
async fn grant_notice_is_posted_with_bearer_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/send"))
        .and(header("Authorization", "Bearer mail-key"))
        .and(body_partial_json(json!({
            "from": "tickets@example.com",
            "to": "ada@example.com",
            "subject": "Your access to Backstage Pass is ready"
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = dispatcher(&server)
        .send_grant_notice("ada@example.com", &grant_notice())
        .await;
    assert!(receipt.sent);
    assert!(receipt.reason.is_none());
}

#[tokio::test]
async fn mail_api_errors_are_reported_not_raised() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/send"))
        .respond_with(ResponseTemplate::new(500).set_body_string("relay down"))
        .expect(1)
        .mount(&server)
        .await;

    let notice = RevokeNotice {
        display_name: None,
        product_id: "501".into(),
        product_title: None,
    };
    let receipt = dispatcher(&server)
        .send_revoke_notice("ada@example.com", &notice, "refund_created")
        .await;
    assert!(!receipt.sent);
    let reason = receipt.reason.expect("reason");
    assert!(reason.contains("500"));
    assert!(reason.contains("relay down"));
}
