mod auth;

pub use auth::{
    AuthError, ClientCredentials, EnvFileSink, TokenManager, TokenSink, TokenState,
    DEFAULT_TOKEN_URL,
};
