use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::exchange::{Exchange, HeaderBytes};

/// Rewrites an exchange before it is written to the archive.
///
/// The hook only ever sees a private copy; the caller keeps the original request and
/// response.
pub trait Obfuscator: Send + Sync {
    fn obfuscate(&self, exchange: &mut Exchange);
}

impl<F> Obfuscator for F
where
    F: Fn(&mut Exchange) + Send + Sync,
{
    fn obfuscate(&self, exchange: &mut Exchange) {
        self(exchange)
    }
}

/// Swaps real credentials for fixed placeholders in the `Authorization` header and in URL
/// user info.
#[derive(Debug, Clone)]
pub struct BasicAuthObfuscator {
    username: String,
    password: String,
}

impl BasicAuthObfuscator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn header_value(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(credentials))
    }

    fn user_info(&self) -> String {
        if self.password.is_empty() {
            self.username.clone()
        } else {
            format!("{}:{}", self.username, self.password)
        }
    }
}

impl Obfuscator for BasicAuthObfuscator {
    fn obfuscate(&self, exchange: &mut Exchange) {
        let request = &mut exchange.request;

        let authorization = request
            .headers
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case("authorization"));
        if let Some((_, values)) = authorization
            && values.iter().any(|value| !value.is_empty())
        {
            *values = vec![HeaderBytes::from(self.header_value())];
        }

        if request.url.user_info.is_some() {
            request.url.user_info = Some(self.user_info());
        }
    }
}
