//! Admin credential check for the mutating operational surface.
//!
//! A caller presents a bearer token that must exactly equal one of the
//! configured secrets. The HTTP layer above maps a rejection to 401/403.

pub struct AdminTokens {
    tokens: Vec<String>,
}

impl AdminTokens {
    pub fn new(tokens: Vec<String>) -> Self {
        let tokens = tokens
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .collect();
        Self { tokens }
    }

    /// Parse a comma-separated token list, as carried by the
    /// `ANIVAULT_ADMIN_TOKENS` environment override.
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(',').map(|t| t.trim().to_string()).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn verify(&self, presented: &str) -> bool {
        !presented.is_empty() && self.tokens.iter().any(|t| t == presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_exact_equality_only() {
        let tokens = AdminTokens::new(vec!["s3cret".to_string(), "other".to_string()]);
        assert!(tokens.verify("s3cret"));
        assert!(tokens.verify("other"));
        assert!(!tokens.verify("S3CRET"));
        assert!(!tokens.verify("s3cret "));
        assert!(!tokens.verify(""));
    }

    #[test]
    fn test_from_csv_skips_blanks() {
        let tokens = AdminTokens::from_csv("alpha, beta,,  ");
        assert!(tokens.verify("alpha"));
        assert!(tokens.verify("beta"));
        assert!(!tokens.verify(""));

        assert!(AdminTokens::from_csv("").is_empty());
    }
}
