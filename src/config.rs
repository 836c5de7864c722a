use crate::error::Error;
use clap::Args as ClapArgs;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_DATA_DIR: &str = "/data/";
const PRODUCTION_URL: &str = "https://business-api.tiktok.com/open_api/";
const SANDBOX_URL: &str = "https://sandbox-ads.tiktok.com/open_api/";
const API_VERSION: &str = "v1.3/";

const KEY_PARAMETERS: &str = "parameters";
const KEY_REPORT_SETTINGS: &str = "report_settings";
const KEY_DESTINATION: &str = "destination";
const REQUIRED_REPORT_SETTINGS: [&str; 6] = [
    "date_from",
    "date_to",
    "dimensions",
    "metrics",
    "report_type",
    "service_type",
];
const REQUIRED_DESTINATION: [&str; 2] = ["incremental", "output_table_name"];

#[derive(ClapArgs)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_DATA_DIR, env = "KBC_DATADIR")]
    pub(crate) data_dir: String,

    #[arg(long, env = "API_URL")]
    pub(crate) api_url: Option<String>,

    #[arg(long, env = "TIKTOK_SANDBOX")]
    pub(crate) sandbox: bool,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Base URL of the report API, including the version segment.
    pub fn api_base_url(&self) -> String {
        match &self.api_url {
            Some(url) => url.clone(),
            None if self.sandbox => format!("{SANDBOX_URL}{API_VERSION}"),
            None => format!("{PRODUCTION_URL}{API_VERSION}"),
        }
    }
}

/// The host's `config.json`.
#[derive(Deserialize, Debug)]
pub struct ComponentConfig {
    pub parameters: Parameters,
    #[serde(default)]
    authorization: Option<Authorization>,
}

#[derive(Deserialize, Debug)]
pub struct Parameters {
    #[serde(rename = "#access_token", default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub advertiser_id: Option<String>,
    pub report_settings: ReportSettings,
    pub destination: Destination,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ReportSettings {
    pub date_from: String,
    pub date_to: String,
    #[serde(deserialize_with = "comma_separated")]
    pub dimensions: Vec<String>,
    #[serde(deserialize_with = "comma_separated")]
    pub metrics: Vec<String>,
    pub report_type: String,
    pub service_type: String,
    #[serde(default)]
    pub data_level: Option<String>,
    #[serde(default)]
    pub filters: Option<Vec<Value>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Destination {
    pub incremental: bool,
    pub output_table_name: String,
}

#[derive(Deserialize, Debug)]
struct Authorization {
    #[serde(default)]
    oauth_api: Option<OauthApi>,
}

#[derive(Deserialize, Debug)]
struct OauthApi {
    #[serde(default)]
    credentials: Option<OauthCredentials>,
}

#[derive(Deserialize, Debug)]
struct OauthCredentials {
    #[serde(rename = "#data", default)]
    data: Option<String>,
}

/// Credential document issued by the OAuth flow.
#[derive(Deserialize, Debug, Clone)]
pub struct Credentials {
    pub data: CredentialsData,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct CredentialsData {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, deserialize_with = "optional_id_list")]
    pub advertiser_ids: Option<Vec<String>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ComponentConfig {
    /// Reads and validates `config.json` from the data folder.
    pub fn load(data_dir: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(data_dir.join("config.json"))?;
        Self::from_json(&contents)
    }

    /// Parses a configuration document, reporting every missing required key
    /// before attempting typed deserialization.
    pub fn from_json(contents: &str) -> Result<Self, Error> {
        let raw: Value = serde_json::from_str(contents).map_err(|e| Error::ConfigValidation {
            message: format!("config is not valid JSON: {e}"),
        })?;

        validate_required(&raw)?;

        let config: ComponentConfig =
            serde_json::from_value(raw).map_err(|e| Error::ConfigValidation {
                message: e.to_string(),
            })?;
        config.parameters.report_settings.validate()?;

        Ok(config)
    }

    /// The OAuth credential document, if the host supplied one.
    ///
    /// # Errors
    /// [`Error::AuthConfig`] if the document is present but malformed.
    pub fn credentials(&self) -> Result<Option<Credentials>, Error> {
        let raw = self
            .authorization
            .as_ref()
            .and_then(|a| a.oauth_api.as_ref())
            .and_then(|o| o.credentials.as_ref())
            .and_then(|c| c.data.as_deref());

        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| Error::AuthConfig {
                    message: format!("could not read OAuth credentials: {e}"),
                }),
        }
    }
}

impl ReportSettings {
    fn validate(&self) -> Result<(), Error> {
        if self.dimensions.is_empty() {
            return Err(Error::ConfigValidation {
                message: "at least one dimension is required".to_string(),
            });
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = self.dimensions.iter().find(|d| !seen.insert(d.as_str())) {
            return Err(Error::ConfigValidation {
                message: format!("dimension '{duplicate}' is listed more than once"),
            });
        }

        Ok(())
    }
}

impl ComponentConfig {
    /// Explicit token first, then the OAuth-issued one. The OAuth document is
    /// only read when no token is configured.
    pub fn access_token(&self) -> Result<String, Error> {
        if let Some(token) = self
            .parameters
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
        {
            return Ok(token.to_string());
        }

        let credentials = self.credentials()?;
        credentials
            .as_ref()
            .and_then(|c| c.data.access_token.clone())
            .ok_or_else(|| Error::AuthConfig {
                message: format!(
                    "could not get access token from OAuth credentials. Response from TikTok: {}",
                    provider_message(credentials.as_ref())
                ),
            })
    }

    /// Explicit comma-separated ids first, then the ids granted via OAuth.
    /// An empty list is not an error.
    pub fn advertiser_ids(&self) -> Result<Vec<String>, Error> {
        let explicit =
            split_comma_separated(self.parameters.advertiser_id.as_deref().unwrap_or_default());
        if !explicit.is_empty() {
            return Ok(explicit);
        }

        let credentials = self.credentials()?;
        credentials
            .as_ref()
            .and_then(|c| c.data.advertiser_ids.clone())
            .ok_or_else(|| Error::AuthConfig {
                message: format!(
                    "could not get advertiser ids from OAuth credentials. Response from TikTok: {}",
                    provider_message(credentials.as_ref())
                ),
            })
    }
}

fn provider_message(credentials: Option<&Credentials>) -> &str {
    credentials
        .and_then(|c| c.data.message.as_deref())
        .unwrap_or("no message")
}

fn validate_required(raw: &Value) -> Result<(), Error> {
    let mut missing = Vec::new();

    let parameters = raw.get(KEY_PARAMETERS).filter(|v| !v.is_null());
    let Some(parameters) = parameters else {
        return Err(Error::ConfigValidation {
            message: format!("missing required parameters: [\"{KEY_PARAMETERS}\"]"),
        });
    };

    for (section, keys) in [
        (KEY_REPORT_SETTINGS, &REQUIRED_REPORT_SETTINGS[..]),
        (KEY_DESTINATION, &REQUIRED_DESTINATION[..]),
    ] {
        match parameters.get(section).filter(|v| !v.is_null()) {
            None => missing.push(section.to_string()),
            Some(section_value) => missing.extend(
                keys.iter()
                    .filter(|key| section_value.get(**key).map_or(true, Value::is_null))
                    .map(|key| format!("{section}.{key}")),
            ),
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::ConfigValidation {
            message: format!("missing required parameters: {missing:?}"),
        })
    }
}

pub(crate) fn split_comma_separated(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrString {
    List(Vec<String>),
    Csv(String),
}

fn comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ListOrString::deserialize(deserializer)? {
        ListOrString::List(items) => items
            .iter()
            .flat_map(|item| split_comma_separated(item))
            .collect(),
        ListOrString::Csv(value) => split_comma_separated(&value),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Id {
    Text(String),
    Number(i64),
}

fn optional_id_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids: Option<Vec<Id>> = Option::deserialize(deserializer)?;
    Ok(ids.map(|ids| {
        ids.into_iter()
            .map(|id| match id {
                Id::Text(text) => text,
                Id::Number(number) => number.to_string(),
            })
            .collect()
    }))
}
