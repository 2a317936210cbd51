//! `bulkflow generate` - synthetic orders and order lines

use bulkflow_engine::request::GeneratorOptions;
use bulkflow_engine::IngestRequest;

use super::{ingest, Invocation};
use crate::error::Result;
use crate::RunOptions;

pub fn build_request(
    orders: u64,
    lines_per_order: u32,
    company_id: i64,
    start_order_number: i64,
    options: &RunOptions,
) -> Result<IngestRequest> {
    let mut request = IngestRequest::generator(GeneratorOptions {
        orders,
        lines_per_order,
        company_id,
        start_order_number,
    });
    options.apply(&mut request)?;
    Ok(request)
}

pub async fn run(
    orders: u64,
    lines_per_order: u32,
    company_id: i64,
    start_order_number: i64,
    options: &RunOptions,
    invocation: Invocation,
) -> Result<()> {
    let request = build_request(orders, lines_per_order, company_id, start_order_number, options)?;
    ingest(request, invocation).await.map(|_| ())
}
