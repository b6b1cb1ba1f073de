//! Authenticity Verifier
//!
//! Resolves the publisher identity a bundle was signed with and gates every
//! install on the candidate carrying exactly the running bundle's identity.
//! The gate fails closed: an identity that cannot be resolved on either side
//! counts as a mismatch.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

use crate::engine::config::IdentityToolConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Signature inspection failed for {path}: {reason}")]
    InspectionFailed { path: String, reason: String },
    #[error("Bundle is not signed: {0}")]
    NotSigned(String),
    #[error("Publisher identity mismatch: expected {expected:?}, found {found:?}")]
    IdentityMismatch {
        expected: String,
        found: Option<String>,
    },
}

/// Produces the raw text a signature-inspection tool prints for a bundle.
pub trait SignatureInspector: Send + Sync {
    fn inspect(&self, bundle: &Path) -> Result<String, AuthError>;
}

/// Runs an external tool (codesign by default) and returns stdout + stderr.
pub struct CommandInspector {
    program: String,
    args: Vec<String>,
}

impl CommandInspector {
    pub fn new(tool: &IdentityToolConfig) -> Self {
        Self {
            program: tool.program.clone(),
            args: tool.args.clone(),
        }
    }
}

impl SignatureInspector for CommandInspector {
    fn inspect(&self, bundle: &Path) -> Result<String, AuthError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(bundle)
            .output()
            .map_err(|e| AuthError::InspectionFailed {
                path: bundle.display().to_string(),
                reason: format!("could not run {}: {}", self.program, e),
            })?;

        // codesign writes its details to stderr and exits non-zero for
        // unsigned code; keep both streams and let the parser decide.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() && text.trim().is_empty() {
            return Err(AuthError::InspectionFailed {
                path: bundle.display().to_string(),
                reason: format!("{} exited with {:?}", self.program, output.status.code()),
            });
        }
        Ok(text)
    }
}

/// Pull the identity token out of inspection output.
pub fn parse_identity(output: &str, token_prefix: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(token_prefix))
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("not set"))
        .map(str::to_string)
}

pub struct AuthenticityVerifier {
    inspector: Box<dyn SignatureInspector>,
    token_prefix: String,
}

impl AuthenticityVerifier {
    pub fn new(inspector: Box<dyn SignatureInspector>, token_prefix: impl Into<String>) -> Self {
        Self {
            inspector,
            token_prefix: token_prefix.into(),
        }
    }

    pub fn from_config(tool: &IdentityToolConfig) -> Self {
        Self::new(Box::new(CommandInspector::new(tool)), tool.token_prefix.clone())
    }

    /// Publisher identity of `bundle`, or `NotSigned` when the tool reports none.
    pub fn signing_identity(&self, bundle: &Path) -> Result<String, AuthError> {
        let output = self.inspector.inspect(bundle)?;
        parse_identity(&output, &self.token_prefix)
            .ok_or_else(|| AuthError::NotSigned(bundle.display().to_string()))
    }

    /// Succeeds only if `candidate` resolves to exactly `current_identity`.
    pub fn verify_team_match(&self, current_identity: &str, candidate: &Path) -> Result<(), AuthError> {
        let expected = current_identity.trim();
        if expected.is_empty() {
            tracing::error!("running bundle has no publisher identity; refusing candidate");
            return Err(AuthError::IdentityMismatch {
                expected: String::new(),
                found: None,
            });
        }

        match self.signing_identity(candidate) {
            Ok(found) if found == expected => {
                tracing::info!(identity = %found, candidate = %candidate.display(), "publisher identity verified");
                Ok(())
            }
            Ok(found) => {
                tracing::error!(%expected, %found, "publisher identity mismatch");
                Err(AuthError::IdentityMismatch {
                    expected: expected.to_string(),
                    found: Some(found),
                })
            }
            Err(e) => {
                tracing::error!(error = %e, candidate = %candidate.display(), "could not resolve candidate identity");
                Err(AuthError::IdentityMismatch {
                    expected: expected.to_string(),
                    found: None,
                })
            }
        }
    }

    /// Resolve the running bundle's identity, then check the candidate against it.
    pub fn verify_same_publisher(&self, current_bundle: &Path, candidate: &Path) -> Result<String, AuthError> {
        let current = self.signing_identity(current_bundle).map_err(|e| {
            tracing::error!(error = %e, "could not resolve the running bundle's identity");
            AuthError::IdentityMismatch {
                expected: String::new(),
                found: None,
            }
        })?;
        self.verify_team_match(&current, candidate)?;
        Ok(current)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::verifier;
    use super::*;

    const CODESIGN_OUTPUT: &str = "Executable=/Applications/Demo.app/Contents/MacOS/Demo\n\
Identifier=com.example.demo\n\
Format=app bundle with Mach-O thin (arm64)\n\
Authority=Developer ID Application: Example Corp (ABCDE12345)\n\
TeamIdentifier=ABCDE12345\n";

    #[test]
    fn test_parse_identity() {
        assert_eq!(parse_identity(CODESIGN_OUTPUT, "TeamIdentifier=").as_deref(), Some("ABCDE12345"));
        assert_eq!(parse_identity("TeamIdentifier=not set\n", "TeamIdentifier="), None);
        assert_eq!(parse_identity("nothing here", "TeamIdentifier="), None);
    }

    #[test]
    fn test_same_team_passes() {
        let a = Path::new("/bundles/A.app");
        let v = verifier(&[(a, "TEAMA")]);
        assert!(v.verify_team_match("TEAMA", a).is_ok());
    }

    #[test]
    fn test_other_team_fails() {
        let b = Path::new("/bundles/B.app");
        let v = verifier(&[(b, "TEAMB")]);
        let err = v.verify_team_match("TEAMA", b).unwrap_err();
        assert!(matches!(err, AuthError::IdentityMismatch { found: Some(ref f), .. } if f == "TEAMB"));
    }

    #[test]
    fn test_unsigned_candidate_fails_closed() {
        let v = verifier(&[]);
        assert!(matches!(
            v.signing_identity(Path::new("/bundles/U.app")),
            Err(AuthError::NotSigned(_))
        ));
        assert!(matches!(
            v.verify_team_match("TEAMA", Path::new("/bundles/U.app")),
            Err(AuthError::IdentityMismatch { found: None, .. })
        ));
    }

    #[test]
    fn test_empty_current_identity_fails_closed() {
        let a = Path::new("/bundles/A.app");
        let v = verifier(&[(a, "TEAMA")]);
        assert!(v.verify_team_match("  ", a).is_err());
    }

    #[test]
    fn test_missing_tool_fails() {
        let tool = IdentityToolConfig {
            program: "/nonexistent/inspector".to_string(),
            args: vec![],
            token_prefix: "TeamIdentifier=".to_string(),
        };
        let v = AuthenticityVerifier::from_config(&tool);
        assert!(matches!(
            v.signing_identity(Path::new("/bundles/A.app")),
            Err(AuthError::InspectionFailed { .. })
        ));
    }
}
