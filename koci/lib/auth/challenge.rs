use regex::Regex;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// The registry wants Basic credentials.
    Basic {
        /// The protection space named by the server.
        realm: Option<String>,
    },

    /// The registry wants a bearer token from the named token service.
    Bearer {
        /// The token endpoint URL.
        realm: String,

        /// The service name to present to the token endpoint.
        service: Option<String>,

        /// The scope(s) the failed request needed, space-separated.
        scope: Option<String>,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Challenge {
    /// Parses a `WWW-Authenticate` header value. Returns `None` for schemes
    /// this client cannot answer or a Bearer challenge without a realm.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (scheme, params) = match value.split_once(char::is_whitespace) {
            Some((scheme, params)) => (scheme, params),
            None => (value, ""),
        };

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        let re = Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|([^",\s]+))"#).unwrap();
        for captures in re.captures_iter(params) {
            let key = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let val = captures
                .get(2)
                .or_else(|| captures.get(3))
                .map(|m| m.as_str().to_string());
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = val,
                "service" => service = val,
                "scope" => scope = val,
                _ => {}
            }
        }

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic { realm });
        }
        if scheme.eq_ignore_ascii_case("bearer") {
            return Some(Challenge::Bearer {
                realm: realm?,
                service,
                scope,
            });
        }
        None
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
