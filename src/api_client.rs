use crate::config::ReportSettings;
use crate::error::Error;
use log::debug;
use reqwest::{header::CONTENT_TYPE, Client, Url};
use serde::Deserialize;
use serde_json::{Map, Value};

const INTEGRATED_REPORT_PATH: &str = "report/integrated/get";
const ACCESS_TOKEN_HEADER: &str = "Access-Token";
const OK_MESSAGE: &str = "OK";
const DATA_LEVEL_NOT_DEFINED: &str = "NOT_DEFINED";

/// One report request for a single advertiser.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportQuery {
    pub advertiser_id: String,
    pub report_type: String,
    pub service_type: String,
    pub data_level: Option<String>,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub date_from: String,
    pub date_to: String,
    pub filters: Vec<Value>,
}

impl ReportQuery {
    pub fn new(
        advertiser_id: &str,
        settings: &ReportSettings,
        date_from: &str,
        date_to: &str,
    ) -> Self {
        ReportQuery {
            advertiser_id: advertiser_id.to_string(),
            report_type: settings.report_type.clone(),
            service_type: settings.service_type.clone(),
            data_level: settings.data_level.clone(),
            dimensions: settings.dimensions.clone(),
            metrics: settings.metrics.clone(),
            date_from: date_from.to_string(),
            date_to: date_to.to_string(),
            filters: settings.filters.clone().unwrap_or_default(),
        }
    }

    /// Query parameters sent with every page of this report. Optional
    /// settings are only included when they carry a value.
    pub fn to_params(&self) -> Result<Vec<(&'static str, String)>, Error> {
        let mut params = vec![
            ("advertiser_id", self.advertiser_id.clone()),
            ("report_type", self.report_type.clone()),
            ("start_date", self.date_from.clone()),
            ("end_date", self.date_to.clone()),
            ("dimensions", quoted_list(&self.dimensions)),
        ];

        if let Some(data_level) = self
            .data_level
            .as_deref()
            .filter(|level| !level.is_empty() && *level != DATA_LEVEL_NOT_DEFINED)
        {
            params.push(("data_level", data_level.to_string()));
        }
        if !self.metrics.is_empty() {
            params.push(("metrics", quoted_list(&self.metrics)));
        }
        if !self.filters.is_empty() {
            params.push(("filtering", serde_json::to_string(&self.filters)?));
        }
        if !self.service_type.is_empty() {
            params.push(("service_type", self.service_type.clone()));
        }

        Ok(params)
    }
}

/// `["a","b"]`, the list encoding the report endpoint expects.
fn quoted_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| format!("\"{item}\"")).collect();
    format!("[{}]", quoted.join(","))
}

/// A single row of the report, as returned by the API.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ReportRow {
    #[serde(default)]
    pub dimensions: Map<String, Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

pub type ReportPage = Vec<ReportRow>;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PageInfo {
    #[serde(rename = "total_page")]
    pub total_pages: u32,
    #[serde(rename = "page", default)]
    pub current_page: u32,
}

#[derive(Deserialize, Debug)]
pub struct ReportData {
    pub page_info: PageInfo,
    #[serde(default)]
    pub list: Option<ReportPage>,
}

/// Response envelope of the report endpoint.
#[derive(Deserialize, Debug)]
pub struct ReportResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<ReportData>,
}

impl ReportResponse {
    /// Unwraps the payload, failing unless the envelope's message is `OK`.
    pub fn into_data(self) -> Result<ReportData, Error> {
        match self.message.as_deref() {
            Some(OK_MESSAGE) => self.data.ok_or_else(|| Error::MalformedResponse {
                message: "response has no data".to_string(),
            }),
            other => Err(Error::RemoteReport {
                message: other.unwrap_or("no message").to_string(),
            }),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ReportApi: Send + Sync {
    /// Requests a single page of the integrated report.
    /// # Arguments
    /// * `query` - The report to request.
    /// * `page` - 1-based page number; page 1 is requested without a `page` parameter.
    /// # Returns
    /// The raw response envelope. The envelope's status is not checked here.
    async fn get_report_page(&self, query: &ReportQuery, page: u32)
        -> Result<ReportResponse, Error>;
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    endpoint: Url,
    access_token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, Error> {
        // A trailing slash keeps the version segment when joining the endpoint path.
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;

        Ok(ApiClient {
            client: Client::new(),
            endpoint: base.join(INTEGRATED_REPORT_PATH)?,
            access_token: access_token.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ReportApi for ApiClient {
    async fn get_report_page(
        &self,
        query: &ReportQuery,
        page: u32,
    ) -> Result<ReportResponse, Error> {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query.to_params()? {
                pairs.append_pair(key, &value);
            }
            if page > 1 {
                pairs.append_pair("page", &page.to_string());
            }
        }

        let resp = self
            .client
            .get(url)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?
            .error_for_status()?;

        Ok(resp.json::<ReportResponse>().await?)
    }
}

/// Pull-based sequence of report pages. Each call to [`ReportPages::next`]
/// issues at most one request; dropping the sequence stops fetching.
pub struct ReportPages<'a, A: ReportApi + ?Sized> {
    api: &'a A,
    query: &'a ReportQuery,
    next_page: u32,
    total_pages: Option<u32>,
    failed: bool,
}

/// Starts a fresh page sequence for `query`, beginning at page 1.
pub fn fetch_report<'a, A: ReportApi + ?Sized>(
    api: &'a A,
    query: &'a ReportQuery,
) -> ReportPages<'a, A> {
    ReportPages {
        api,
        query,
        next_page: 1,
        total_pages: None,
        failed: false,
    }
}

impl<A: ReportApi + ?Sized> ReportPages<'_, A> {
    /// Fetches the next page. Returns `None` once every page was yielded or
    /// after the first error.
    pub async fn next(&mut self) -> Option<Result<ReportPage, Error>> {
        if self.is_exhausted() {
            return None;
        }

        let result = self.fetch_next().await;
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }

    /// Total page count, known once the first page has been fetched.
    pub fn total_pages(&self) -> Option<u32> {
        self.total_pages
    }

    fn is_exhausted(&self) -> bool {
        self.failed
            || self
                .total_pages
                .is_some_and(|total_pages| self.next_page > total_pages)
    }

    async fn fetch_next(&mut self) -> Result<ReportPage, Error> {
        let data = self
            .api
            .get_report_page(self.query, self.next_page)
            .await?
            .into_data()?;

        if self.total_pages.is_none() {
            // an empty report still answers with a single, empty page
            self.total_pages = Some(data.page_info.total_pages.max(1));
        }
        debug!(
            "Fetched page {} of {} for advertiser {}",
            data.page_info.current_page, data.page_info.total_pages, self.query.advertiser_id
        );
        self.next_page += 1;

        Ok(data.list.unwrap_or_default())
    }
}
