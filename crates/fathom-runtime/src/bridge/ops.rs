//! deno_core ops behind the bridge. Only the bootstrap script sees these;
//! guest code reaches them through the library modules.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use deno_core::error::AnyError;
use deno_core::{op2, OpState};
use serde_json::Value;

use super::{
    crypto, BridgeHandles, CallState, ChainOutput, FetchRequest, FetchResponse, GuestLogLevel,
    GuestLogRecord, LinkFailure,
};

deno_core::extension!(
    fathom_bridge,
    ops = [
        op_fathom_log,
        op_fathom_take_input,
        op_fathom_set_result,
        op_fathom_link_error,
        op_fathom_fetch,
        op_fathom_store_get,
        op_fathom_store_set,
        op_fathom_store_del,
        op_fathom_store_ttl,
        op_fathom_hash,
        op_fathom_random_uuid,
        op_fathom_random_bytes,
        op_fathom_random_int,
    ],
);

fn handles(state: &OpState) -> Result<&BridgeHandles, AnyError> {
    state
        .try_borrow::<BridgeHandles>()
        .ok_or_else(|| anyhow!("host bridge has been released"))
}

#[op2(fast)]
fn op_fathom_log(
    state: &mut OpState,
    #[string] level: String,
    #[string] message: String,
) -> Result<(), AnyError> {
    let level: GuestLogLevel = level.parse().map_err(|e: String| anyhow!(e))?;
    let call = state.try_borrow::<CallState>();
    let debug = call.map_or(false, |c| c.debug);
    if level == GuestLogLevel::Debug && !debug {
        return Ok(());
    }
    let h = handles(state)?;
    h.logger.log(&GuestLogRecord {
        level,
        message: &message,
        pipeline_id: &h.pipeline_id,
        workspace_id: &h.workspace_id,
        call_id: call.map_or("", |c| c.call_id.as_str()),
    });
    Ok(())
}

#[op2]
#[string]
fn op_fathom_take_input(state: &mut OpState) -> Result<String, AnyError> {
    state
        .try_borrow_mut::<CallState>()
        .and_then(|c| c.input.take())
        .ok_or_else(|| anyhow!("no pending invocation"))
}

#[op2(fast)]
fn op_fathom_set_result(state: &mut OpState, #[string] envelope: String) {
    state.put(ChainOutput(envelope));
}

#[op2(fast)]
fn op_fathom_link_error(
    state: &mut OpState,
    #[string] function_id: String,
    #[string] message: String,
) {
    state.put(LinkFailure {
        function_id,
        message,
    });
}

#[op2(async)]
#[serde]
async fn op_fathom_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, AnyError> {
    let fetcher = {
        let state = state.borrow();
        handles(&state)?.fetcher.clone()
    };
    fetcher.fetch(&url, request).await
}

#[op2(async)]
#[serde]
async fn op_fathom_store_get(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
) -> Result<Option<Value>, AnyError> {
    let (store, key) = {
        let state = state.borrow();
        let h = handles(&state)?;
        (h.store.clone(), h.store_key(&key))
    };
    store.get(&key).await
}

#[op2(async)]
#[serde]
async fn op_fathom_store_set(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
    #[serde] value: serde_json::Value,
    ttl_secs: Option<f64>,
) -> Result<(), AnyError> {
    let ttl = match ttl_secs {
        None => None,
        Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => return Err(anyhow!("store.set ttl must be a positive number, got {secs}")),
    };
    let (store, key) = {
        let state = state.borrow();
        let h = handles(&state)?;
        (h.store.clone(), h.store_key(&key))
    };
    store.set(&key, value, ttl).await
}

#[op2(async)]
async fn op_fathom_store_del(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
) -> Result<bool, AnyError> {
    let (store, key) = {
        let state = state.borrow();
        let h = handles(&state)?;
        (h.store.clone(), h.store_key(&key))
    };
    store.del(&key).await
}

#[op2(async)]
#[serde]
async fn op_fathom_store_ttl(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
) -> Result<i64, AnyError> {
    let (store, key) = {
        let state = state.borrow();
        let h = handles(&state)?;
        (h.store.clone(), h.store_key(&key))
    };
    store.ttl(&key).await
}

#[op2]
#[string]
fn op_fathom_hash(
    #[string] algorithm: String,
    #[string] data: String,
    #[string] encoding: String,
) -> Result<String, AnyError> {
    crypto::hash(&algorithm, &data, &encoding)
}

#[op2]
#[string]
fn op_fathom_random_uuid() -> String {
    crypto::random_uuid()
}

#[op2]
#[serde]
fn op_fathom_random_bytes(state: &mut OpState, #[serde] len: usize) -> Result<Vec<u8>, AnyError> {
    let max = handles(state)?.max_random_bytes;
    crypto::random_bytes(len, max)
}

#[op2]
#[serde]
fn op_fathom_random_int(#[serde] min: i64, #[serde] max: i64) -> Result<i64, AnyError> {
    crypto::random_int(min, max)
}
