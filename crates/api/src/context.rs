use postbox_auth::{Role, TokenPayload};

/// Authenticated caller for a request, derived from its bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    payload: TokenPayload,
}

impl CallerContext {
    pub fn new(payload: TokenPayload) -> Self {
        Self { payload }
    }

    pub fn username(&self) -> &str {
        &self.payload.username
    }

    pub fn role(&self) -> Role {
        self.payload.role
    }

    pub fn payload(&self) -> &TokenPayload {
        &self.payload
    }
}
