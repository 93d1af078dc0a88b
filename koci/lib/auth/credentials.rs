use getset::Getters;
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Credentials presented to a registry and its token service.
///
/// All fields are optional; an empty value authenticates anonymously. A
/// refresh token (or `force_oauth2`) switches token acquisition to the OAuth2
/// endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct RegistryAuth {
    /// The username for Basic authentication and the password grant.
    #[builder(default, setter(strip_option, into))]
    username: Option<String>,

    /// The password for Basic authentication and the password grant.
    #[builder(default, setter(strip_option, into))]
    password: Option<String>,

    /// A refresh token previously issued by the registry's token service.
    #[builder(default, setter(strip_option, into))]
    refresh_token: Option<String>,

    /// Forces OAuth2 token acquisition even without a refresh token.
    #[builder(default)]
    force_oauth2: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryAuth {
    /// Returns the username/password pair when both are present and non-empty.
    pub fn basic_pair(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some((username, password))
            }
            _ => None,
        }
    }

    /// Returns true when token acquisition should use the OAuth2 endpoint.
    pub fn prefers_oauth2(&self) -> bool {
        self.force_oauth2 || self.refresh_token.is_some()
    }
}
