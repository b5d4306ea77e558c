use actix_web::{HttpResponse, Result, web};

use crate::middlewares::{CurrentUser, RequestCapabilities};
use crate::models::{
    ApiResponse, Capability, CapabilitySet, CheckoutRequest, CheckoutResponse, Entitlement,
    SubscriptionResponse,
};
use crate::services::{CheckoutService, EntitlementService, SubscriptionService};

#[utoipa::path(
    post,
    path = "/api/v1/billing/checkout",
    tag = "billing",
    request_body = CheckoutRequest,
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Checkout 会话已创建", body = CheckoutResponse),
        (status = 400, description = "请求参数错误或已有进行中的订阅"),
        (status = 401, description = "未授权"),
        (status = 503, description = "支付网关未启用")
    )
)]
pub async fn create_checkout(
    user: CurrentUser,
    checkout_service: web::Data<CheckoutService>,
    request: web::Json<CheckoutRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    let response = checkout_service
        .start_checkout(user.0, request.tier, request.billing_cycle)
        .await?;
    Ok(ApiResponse::ok(response))
}

#[utoipa::path(
    get,
    path = "/api/v1/billing/entitlement",
    tag = "billing",
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "当前访问权限", body = Entitlement),
        (status = 401, description = "未授权")
    )
)]
pub async fn get_entitlement(
    user: CurrentUser,
    entitlement_service: web::Data<EntitlementService>,
) -> Result<HttpResponse> {
    let entitlement = entitlement_service.entitlement(user.0).await?;
    Ok(ApiResponse::ok(entitlement))
}

#[utoipa::path(
    get,
    path = "/api/v1/billing/subscription",
    tag = "billing",
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "本地保存的订阅记录", body = SubscriptionResponse),
        (status = 401, description = "未授权")
    )
)]
pub async fn get_subscription(
    user: CurrentUser,
    subscription_service: web::Data<SubscriptionService>,
) -> Result<HttpResponse> {
    let response = subscription_service
        .find_by_user(user.0)
        .await?
        .map(SubscriptionResponse::from)
        .unwrap_or_else(|| SubscriptionResponse::free(user.0));
    Ok(ApiResponse::ok(response))
}

#[utoipa::path(
    get,
    path = "/api/v1/billing/capabilities",
    tag = "billing",
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "当前套餐包含的功能", body = CapabilitySet),
        (status = 401, description = "未授权")
    )
)]
pub async fn get_capabilities(capabilities: RequestCapabilities) -> Result<HttpResponse> {
    Ok(ApiResponse::ok(capabilities.0))
}

#[utoipa::path(
    get,
    path = "/api/v1/billing/capabilities/{capability}",
    tag = "billing",
    params(
        ("capability" = Capability, Path, description = "功能名称，如 market_analytics")
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "当前套餐包含该功能"),
        (status = 401, description = "未授权"),
        (status = 403, description = "当前套餐不包含该功能")
    )
)]
pub async fn check_capability(
    capabilities: RequestCapabilities,
    capability: web::Path<Capability>,
) -> Result<HttpResponse> {
    let capability = capability.into_inner();
    capabilities.require(capability)?;
    Ok(ApiResponse::ok(serde_json::json!({ "capability": capability, "allowed": true })))
}

pub fn billing_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/billing")
            .route("/checkout", web::post().to(create_checkout))
            .route("/entitlement", web::get().to(get_entitlement))
            .route("/subscription", web::get().to(get_subscription))
            .route("/capabilities", web::get().to(get_capabilities))
            .route("/capabilities/{capability}", web::get().to(check_capability)),
    );
}
