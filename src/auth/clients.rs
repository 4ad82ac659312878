use oauth2::{AuthUrl, Client, ClientId, ClientSecret, RedirectUrl, TokenUrl, basic::BasicClient};

pub(crate) type GoogleClient = Client<
    oauth2::StandardErrorResponse<oauth2::basic::BasicErrorResponseType>,
    oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>,
    oauth2::StandardTokenIntrospectionResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>,
    oauth2::StandardRevocableToken,
    oauth2::StandardErrorResponse<oauth2::RevocationErrorResponseType>,
    oauth2::EndpointSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointSet,
>;

pub(crate) const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Google OAuth client built from the environment. The identity provider is
/// an external collaborator: all the core ever sees of it is the stable
/// subject id plus a couple of profile fields.
#[derive(Clone)]
pub struct Clients {
    pub(crate) google: GoogleClient,
}

impl Clients {
    pub fn from_env() -> anyhow::Result<Self> {
        let client_id = ClientId::new(dotenv::var("GOOGLE_CLIENT_ID")?);
        let client_secret = ClientSecret::new(dotenv::var("GOOGLE_CLIENT_SECRET")?);
        let redirect_url = RedirectUrl::new(dotenv::var("GOOGLE_REDIRECT_URL")?)?;

        let auth_url = AuthUrl::new("https://accounts.google.com/o/oauth2/v2/auth".to_string())?;
        let token_url = TokenUrl::new("https://oauth2.googleapis.com/token".to_string())?;

        let google = BasicClient::new(client_id)
            .set_client_secret(client_secret)
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);

        Ok(Clients { google })
    }
}
