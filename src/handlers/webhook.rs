use crate::models::{WebhookAck, WebhookOutcome};
use crate::services::WebhookService;
use actix_web::{HttpRequest, HttpResponse, Result, web};
use log::{error, info, warn};

/// Stripe webhook 处理器
///
/// 签名错误返回 401；重复投递同样返回 200，避免 Stripe 无意义地重试。
/// 无法应用的事件记为 failed 并返回 200，由对账任务兜底；
/// 暂时性错误返回 5xx，让 Stripe 重新投递。
#[utoipa::path(
    post,
    path = "/webhook/stripe",
    tag = "webhook",
    request_body(content = String, description = "Stripe 原始事件 JSON", content_type = "application/json"),
    params(
        ("Stripe-Signature" = String, Header, description = "Stripe 签名头")
    ),
    responses(
        (status = 200, description = "事件已接收", body = WebhookAck),
        (status = 400, description = "缺少签名头或事件无法解析"),
        (status = 401, description = "签名校验失败"),
        (status = 500, description = "处理失败，等待重新投递")
    )
)]
pub async fn stripe_webhook(
    req: HttpRequest,
    body: web::Bytes,
    webhook_service: web::Data<WebhookService>,
) -> Result<HttpResponse> {
    let Some(signature) = req
        .headers()
        .get("stripe-signature")
        .and_then(|sig| sig.to_str().ok())
    else {
        warn!("Missing Stripe-Signature header");
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "success": false,
            "error": {
                "code": "VALIDATION_ERROR",
                "message": "Missing Stripe-Signature header"
            }
        })));
    };

    match webhook_service.handle(&body, signature).await {
        Ok(outcome) => {
            match outcome {
                WebhookOutcome::Failed => {
                    warn!("Webhook event recorded as failed; reconciliation will repair it")
                }
                other => info!("Webhook event handled: {other:?}"),
            }
            Ok(HttpResponse::Ok().json(WebhookAck::from(outcome)))
        }
        Err(e) => {
            error!("Failed to process webhook event: {e}");
            Err(e.into())
        }
    }
}

pub fn webhook_config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/webhook").route("/stripe", web::post().to(stripe_webhook)));
}
