use actix_web::{Error, FromRequest, HttpMessage, HttpRequest, dev::Payload, web};
use futures_util::future::LocalBoxFuture;

use crate::error::{AppError, AppResult};
use crate::middlewares::auth::CurrentUser;
use crate::models::{Capability, CapabilitySet};
use crate::services::EntitlementService;

/// 当前请求者的能力集合；同一请求内只查询一次，结果缓存在请求扩展中
#[derive(Debug, Clone)]
pub struct RequestCapabilities(pub CapabilitySet);

impl RequestCapabilities {
    pub fn require(&self, capability: Capability) -> AppResult<()> {
        if self.0.allows(capability) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "{capability:?} requires the {} tier or above",
                capability.minimum_tier()
            )))
        }
    }
}

impl FromRequest for RequestCapabilities {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            if let Some(cached) = req.extensions().get::<RequestCapabilities>() {
                return Ok(cached.clone());
            }

            let user = req
                .extensions()
                .get::<CurrentUser>()
                .copied()
                .ok_or_else(|| AppError::AuthError("Missing access token".to_string()))?;
            let service = req
                .app_data::<web::Data<EntitlementService>>()
                .cloned()
                .ok_or_else(|| {
                    AppError::InternalError("Entitlement service is not configured".to_string())
                })?;

            let resolved = RequestCapabilities(service.capabilities(user.0).await?);
            req.extensions_mut().insert(resolved.clone());
            Ok(resolved)
        })
    }
}
