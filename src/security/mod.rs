pub mod audit_log;
pub mod cipher;
pub mod credential_cache;
pub mod signature;
pub mod token_issuer;
