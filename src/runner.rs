use crate::api_client::{fetch_report, ApiClient, ReportApi, ReportQuery};
use crate::config::{ComponentConfig, Config, Parameters};
use crate::data::{create_slices_dir, AdvertiserSink, OutputTable};
use crate::dates::{DateResolver, DATE_FORMAT};
use crate::error::Error;
use crate::state::{record_last_run, FileStateStore, StateStore};
use chrono::{Local, NaiveDate};
use log::{info, warn};
use std::path::Path;

const PROGRESS_LOG_INTERVAL: usize = 100;

/// Runs the whole job against the host data folder.
pub async fn run(config: Config) -> Result<(), Error> {
    let data_dir = config.data_dir();
    let component = ComponentConfig::load(&data_dir)?;
    let state = FileStateStore::new(&data_dir);
    let today = Local::now().date_naive();

    // stamped before extraction, so a failed run still moves "last run" forward
    record_last_run(&state, &today.format(DATE_FORMAT).to_string())?;

    let access_token = component.access_token()?;
    let client = ApiClient::new(&config.api_base_url(), &access_token)?;

    let table = extract_reports(
        &component.parameters,
        || component.advertiser_ids(),
        &client,
        &state,
        &data_dir.join("out").join("tables"),
        today,
    )
    .await?;

    info!("Extraction finished, output table {}", table.name);
    Ok(())
}

/// Fetches the report for every advertiser and writes one file per advertiser
/// plus the table manifest under `tables_dir`.
///
/// Advertisers are processed in order, one page at a time. The first failure
/// aborts the run; files already written stay on disk.
pub async fn extract_reports<F>(
    params: &Parameters,
    advertiser_ids: F,
    api: &dyn ReportApi,
    state: &dyn StateStore,
    tables_dir: &Path,
    today: NaiveDate,
) -> Result<OutputTable, Error>
where
    F: FnOnce() -> Result<Vec<String>, Error>,
{
    let settings = &params.report_settings;
    let table = OutputTable::new(
        &params.destination.output_table_name,
        &settings.dimensions,
        &settings.metrics,
        params.destination.incremental,
    );

    if table.lacks_time_key() {
        warn!(
            "You are using incremental mode, but are not using any dimension for time/date, \
             therefore you are overwriting data in the source and will not know the range of \
             the data. We encourage you to use stat_time_day in the dimensions if possible"
        );
    }

    let advertiser_ids = advertiser_ids()?;

    let resolver = DateResolver::new(state, today);
    let date_from = resolver.resolve(&settings.date_from)?;
    let date_to = resolver.resolve(&settings.date_to)?;
    if date_from > date_to {
        warn!("date_from {date_from} is after date_to {date_to}, the report may be empty");
    }

    let slices_dir = create_slices_dir(&table, tables_dir)?;
    let schema = table.schema();

    info!("Fetching data for advertisers: {advertiser_ids:?} from {date_from} to {date_to}");

    for advertiser_id in &advertiser_ids {
        info!("Fetching data for advertiser: {advertiser_id}");
        let query = ReportQuery::new(advertiser_id, settings, &date_from, &date_to);
        let mut sink = AdvertiserSink::create(&slices_dir, advertiser_id, schema.clone())?;

        let mut pages = fetch_report(api, &query);
        let mut page_index = 0;
        while let Some(page) = pages.next().await {
            let rows = page?;
            if page_index % PROGRESS_LOG_INTERVAL == 0 {
                info!("Fetching page {page_index} for advertiser {advertiser_id}");
            }
            sink.write_page(&rows)?;
            page_index += 1;
        }

        info!(
            "Wrote {} rows from {} pages for advertiser {advertiser_id} to {}",
            sink.rows_written(),
            pages.total_pages().unwrap_or_default(),
            sink.path().display()
        );
    }

    table.write_manifest(tables_dir)?;

    Ok(table)
}
