use crate::error::{AppError, AppResult};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// 身份由外部认证系统签发，这里只负责校验并取出用户 ID
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    pub exp: i64,
    pub iat: i64,
    pub token_type: String, // "access" or "refresh"
}

#[derive(Clone)]
pub struct JwtService {
    #[cfg(test)]
    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            #[cfg(test)]
            encoding_key: jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// 本服务不签发令牌，仅供测试构造请求
    #[cfg(test)]
    pub fn generate_access_token(&self, user_id: i64, expires_in: i64) -> AppResult<String> {
        use jsonwebtoken::{Header, encode};

        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::seconds(expires_in);

        let claims = Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            token_type: "access".to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(AppError::JwtError)
    }

    pub fn verify_token(&self, token: &str) -> AppResult<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(AppError::JwtError)
    }

    /// 校验 access token 并返回用户 ID
    pub fn verify_access_token(&self, token: &str) -> AppResult<i64> {
        let claims = self.verify_token(token)?;

        if claims.token_type != "access" {
            return Err(AppError::AuthError("Invalid access token type".to_string()));
        }

        claims
            .sub
            .parse::<i64>()
            .map_err(|_| AppError::AuthError("Invalid subject in access token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_round_trip() {
        let jwt = JwtService::new("test-secret");
        let token = jwt.generate_access_token(42, 60).unwrap();
        assert_eq!(jwt.verify_access_token(&token).unwrap(), 42);
    }

    #[test]
    fn test_rejects_foreign_signature() {
        let token = JwtService::new("other-secret")
            .generate_access_token(42, 60)
            .unwrap();
        assert!(JwtService::new("test-secret").verify_access_token(&token).is_err());
    }
}
