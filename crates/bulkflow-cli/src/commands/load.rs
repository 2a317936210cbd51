//! `bulkflow load` - ad-hoc loads of a single source

use bulkflow_engine::request::{ApiOptions, CsvOptions, JsonMode, JsonOptions};
use bulkflow_engine::IngestRequest;

use super::{ingest, Invocation};
use crate::error::{CliError, Result};
use crate::{split_pair, LoadSource};

/// Translate the parsed subcommand into an ingestion request
pub fn build_request(source: &LoadSource) -> Result<IngestRequest> {
    let (mut request, options) = match source {
        LoadSource::Csv {
            file,
            table,
            delimiter,
            compression,
            options,
        } => {
            let mut request = IngestRequest::csv(table.as_str(), file);
            request.csv = Some(CsvOptions {
                file_path: file.clone(),
                delimiter: *delimiter,
                compression: (*compression).into(),
            });
            (request, options)
        }
        LoadSource::Json {
            file,
            table,
            ndjson,
            compression,
            options,
        } => {
            let mode = if *ndjson {
                JsonMode::Ndjson
            } else {
                JsonMode::Array
            };
            let mut request = IngestRequest::json(table.as_str(), file, mode);
            request.json = Some(JsonOptions {
                mode,
                file_path: file.clone(),
                compression: (*compression).into(),
            });
            (request, options)
        }
        LoadSource::Api {
            url,
            table,
            method,
            headers,
            body,
            data_path,
            next_page_path,
            max_pages,
            min_request_interval_ms,
            parallel_pages,
            timeout_ms,
            options,
        } => {
            let mut api = ApiOptions::new(url.as_str());
            api.method = method.clone();
            for header in headers {
                let (name, value) = split_pair(header, ':').ok_or_else(|| {
                    CliError::InvalidArgument(format!("header '{header}' is not NAME: VALUE"))
                })?;
                api.headers.insert(name.to_string(), value.to_string());
            }
            api.body = body
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| CliError::InvalidArgument(format!("--body is not valid JSON: {e}")))?;
            api.data_path = data_path.clone();
            api.next_page_path = next_page_path.clone();
            api.max_pages = *max_pages;
            api.min_request_interval_ms = *min_request_interval_ms;
            api.parallel_pages = *parallel_pages;
            api.timeout_ms = *timeout_ms;
            (IngestRequest::api(table.as_str(), api), options)
        }
    };
    options.apply(&mut request)?;
    Ok(request)
}

pub async fn run(source: &LoadSource, invocation: Invocation) -> Result<()> {
    let request = build_request(source)?;
    ingest(request, invocation).await.map(|_| ())
}
