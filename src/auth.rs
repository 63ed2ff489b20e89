//! Selects the credentials a viewer uses to fetch objects from an archive.

use crate::config::WadoConfig;
use crate::manifest::HttpTag;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WadoAuthentication {
	/// Basic credentials embedded as `webLogin`.
	Basic {
		base_url: String,
		/// base64(`login:password`), present only if both parts are configured.
		token: Option<String>,
	},
	/// The access token of the request forwarded as an `Authorization` header.
	Bearer {
		base_url: String,
		authorization: HttpTag,
	},
}

impl WadoAuthentication {
	/// Basic is used whenever the archive forces it or the request is anonymous.
	pub fn resolve(
		wado: &WadoConfig,
		is_request_authenticated: bool,
		access_token: Option<&str>,
	) -> Self {
		if wado.force_basic_auth || !is_request_authenticated {
			let token = match (&wado.login, &wado.password) {
				(Some(login), Some(password)) => {
					Some(STANDARD.encode(format!("{login}:{password}")))
				}
				_ => None,
			};
			Self::Basic {
				base_url: wado.basic_url.clone(),
				token,
			}
		} else {
			Self::Bearer {
				base_url: wado.oauth2_url.clone(),
				authorization: HttpTag::new(
					"Authorization",
					format!("Bearer {}", access_token.unwrap_or_default()),
				),
			}
		}
	}

	pub fn base_url(&self) -> &str {
		match self {
			Self::Basic { base_url, .. } | Self::Bearer { base_url, .. } => base_url,
		}
	}

	pub fn basic_token(&self) -> Option<&str> {
		match self {
			Self::Basic { token, .. } => token.as_deref(),
			Self::Bearer { .. } => None,
		}
	}

	pub fn http_tags(&self) -> Vec<HttpTag> {
		match self {
			Self::Basic { .. } => Vec::new(),
			Self::Bearer { authorization, .. } => vec![authorization.clone()],
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn wado(force_basic_auth: bool) -> WadoConfig {
		WadoConfig {
			force_basic_auth,
			basic_url: String::from("http://pacs/basic"),
			oauth2_url: String::from("http://pacs/oauth2"),
			login: Some(String::from("viewer")),
			password: Some(String::from("secret")),
			..WadoConfig::default()
		}
	}

	#[rstest]
	#[case(true, true, false)]
	#[case(false, true, true)]
	#[case(false, false, false)]
	#[case(true, false, false)]
	fn rule_table(#[case] force_basic: bool, #[case] authenticated: bool, #[case] bearer: bool) {
		let auth = WadoAuthentication::resolve(&wado(force_basic), authenticated, Some("abc"));
		assert_eq!(matches!(auth, WadoAuthentication::Bearer { .. }), bearer);
		if bearer {
			assert_eq!(auth.base_url(), "http://pacs/oauth2");
			assert_eq!(auth.basic_token(), None);
			assert_eq!(auth.http_tags(), [HttpTag::new("Authorization", "Bearer abc")]);
		} else {
			assert_eq!(auth.base_url(), "http://pacs/basic");
			// "viewer:secret"
			assert_eq!(auth.basic_token(), Some("dmlld2VyOnNlY3JldA=="));
			assert!(auth.http_tags().is_empty());
		}
	}

	#[test]
	fn basic_without_password_has_no_token() {
		let config = WadoConfig {
			password: None,
			..wado(true)
		};
		let auth = WadoAuthentication::resolve(&config, false, None);
		assert_eq!(auth.basic_token(), None);
		assert_eq!(auth.base_url(), "http://pacs/basic");
	}
}
