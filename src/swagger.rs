use actix_web::web;
use utoipa::OpenApi;
use utoipa::{
    Modify,
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::entities::{PlanTier, SubscriptionStatus};
use crate::external::BillingCycle;
use crate::handlers;
use crate::models::*;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            )
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::billing::create_checkout,
        handlers::billing::get_entitlement,
        handlers::billing::get_subscription,
        handlers::billing::get_capabilities,
        handlers::billing::check_capability,
        handlers::webhook::stripe_webhook,
    ),
    components(
        schemas(
            PlanTier,
            SubscriptionStatus,
            BillingCycle,
            CheckoutRequest,
            CheckoutResponse,
            SubscriptionResponse,
            Entitlement,
            Capability,
            CapabilitySet,
            WebhookOutcome,
            WebhookAck,
            ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "billing", description = "Subscription checkout and entitlement API"),
        (name = "webhook", description = "Stripe webhook ingestion"),
    ),
    info(
        title = "Realty Billing API",
        version = "1.0.0",
        description = "Subscription lifecycle and billing reconciliation REST API documentation"
    )
)]
pub struct ApiDoc;

pub fn swagger_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
    )
    .route(
        "/swagger-ui",
        web::get().to(|| async {
            actix_web::HttpResponse::Found()
                .append_header(("Location", "/swagger-ui/"))
                .finish()
        }),
    );
}
