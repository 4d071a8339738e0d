use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};

use ember_types::api::ExpiryClaim;

/// Read the `exp` claim (unix seconds) of an access token without checking
/// its signature. Returns `None` when the token is not a well-formed JWT.
pub fn access_expiry(token: &str) -> Option<i64> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .map(|data| data.claims.exp)
}
