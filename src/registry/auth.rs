use http_auth::{parser::ChallengeParser, ChallengeRef};

/// An authentication challenge from a registry's `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic {
        realm: Option<String>,
    },
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    /// Parse a `WWW-Authenticate` value such as
    /// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
    ///
    /// A header may list several challenges; a Bearer challenge is preferred over Basic.
    /// Returns `None` when no supported challenge is offered. Bearer challenges without a realm
    /// are not supported.
    pub fn parse(header: &str) -> Option<Self> {
        Self::select(std::iter::once(header))
    }

    /// Pick the preferred challenge across every `WWW-Authenticate` value of a response.
    pub fn select<'a>(headers: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut basic = None;
        for header in headers {
            for challenge in ChallengeParser::new(header) {
                // The parser stops at the first malformed challenge
                let Ok(challenge) = challenge else { break };
                match Challenge::try_from(&challenge) {
                    Ok(bearer @ Challenge::Bearer { .. }) => return Some(bearer),
                    Ok(challenge) => {
                        basic.get_or_insert(challenge);
                    }
                    Err(_) => {}
                }
            }
        }
        basic
    }
}

impl TryFrom<&ChallengeRef<'_>> for Challenge {
    type Error = String;

    fn try_from(value: &ChallengeRef<'_>) -> Result<Self, Self::Error> {
        let param = |name: &str| {
            value
                .params
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.to_unescaped())
        };

        if value.scheme.eq_ignore_ascii_case("Basic") {
            Ok(Challenge::Basic {
                realm: param("realm"),
            })
        } else if value.scheme.eq_ignore_ascii_case("Bearer") {
            Ok(Challenge::Bearer {
                realm: param("realm").ok_or("missing required parameter realm")?,
                service: param("service"),
                scope: param("scope"),
            })
        } else {
            Err(format!("unsupported challenge scheme {:?}", value.scheme))
        }
    }
}
