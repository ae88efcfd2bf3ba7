use serde::Deserialize;
use serde_json::{Value, json};

use crate::query::QueryEngine;

use super::ServeError;

/// Method dispatch shared by the HTTP endpoint and the websocket.
pub fn dispatch(
    query: &QueryEngine,
    method: &str,
    params: &Value,
) -> Result<Value, ServeError> {
    match method {
        "getAccountInfo" => get_account_info(query, params),
        "getAddressTxids" => get_address_txids(query, params),
        "getAddressHistory" => get_address_history(query, params),
        "getBlockHeader" => get_block_header(query, params),
        "getDetailedTransaction" => get_detailed_transaction(query, params),
        "sendTransaction" => send_transaction(query, params),
        "getMempoolEntry" => get_mempool_entry(query, params),
        "estimateFee" => estimate_fee(query, params),
        "estimateSmartFee" => estimate_smart_fee(query, params),
        "getInfo" => to_result(query.get_info()),
        _ => Err(ServeError::UnknownMethod),
    }
}

fn parse<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T, ServeError> {
    serde_json::from_value(params.clone())
        .map_err(|e| ServeError::bad_request(format!("malformed params: {e}")))
}

fn to_result(value: impl serde::Serialize) -> Result<Value, ServeError> {
    Ok(json!({ "result": serde_json::to_value(value).map_err(ServeError::bad_request)? }))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AccountInfoParams {
    descriptor: String,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
}

fn get_account_info(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let p: AccountInfoParams = parse(params)?;

    let details = p.details.as_deref().unwrap_or("txids");
    let page_size = p.page_size.unwrap_or(25).max(1);

    let mut info = query.get_address(&p.descriptor, p.page.unwrap_or(0), page_size)?;

    match details {
        "basic" | "balance" => {
            info.txs.clear();
        }
        "txids" => {
            // txid-only listing: strip the materialized ios
            for tx in &mut info.txs {
                tx.vin.clear();
                tx.vout.clear();
            }
        }
        _ => {}
    }

    to_result(info)
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct AddrRangeOpts {
    #[serde(default)]
    start: u32,
    #[serde(default)]
    end: u32,
    #[serde(default)]
    query_mempool_only: bool,
    #[serde(default)]
    from: usize,
    #[serde(default)]
    to: Option<usize>,
}

fn addr_params(params: &Value) -> Result<(Vec<String>, AddrRangeOpts), ServeError> {
    let (addresses, opts): (Vec<String>, AddrRangeOpts) = parse(params)?;
    Ok((addresses, opts))
}

fn get_address_txids(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let (addresses, opts) = addr_params(params)?;

    // bitcore range convention: start is the higher bound, end the lower
    let txids =
        query.get_address_txids(&addresses, opts.end, opts.start, opts.query_mempool_only)?;

    to_result(txids)
}

fn get_address_history(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let (addresses, opts) = addr_params(params)?;

    let history = query.get_address_history(
        &addresses,
        opts.from,
        opts.to.unwrap_or(usize::MAX),
        opts.end,
        opts.start,
        opts.query_mempool_only,
    )?;

    to_result(history)
}

fn get_block_header(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let (height_or_hash,): (String,) = parse(params)?;
    to_result(query.get_block_header(&height_or_hash)?)
}

fn get_detailed_transaction(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let (txid,): (String,) = parse(params)?;
    to_result(query.get_transaction(&txid)?)
}

fn send_transaction(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let (raw_hex,): (String,) = parse(params)?;
    to_result(query.send_transaction(&raw_hex)?)
}

fn get_mempool_entry(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let (txid,): (String,) = parse(params)?;
    to_result(query.get_mempool_entry(&txid)?)
}

fn estimate_fee(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let (blocks,): (u16,) = parse(params)?;
    to_result(query.estimate_fee(blocks)?)
}

fn estimate_smart_fee(query: &QueryEngine, params: &Value) -> Result<Value, ServeError> {
    let (blocks, conservative): (u16, bool) = parse(params)?;
    to_result(query.estimate_smart_fee(blocks, conservative)?)
}
