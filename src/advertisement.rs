//! Backend advertisement global
//!
//! Answers `request_info` with the backend's name and arguments so a client
//! can open the same buffer backend locally.

use strata_wire::protocol::backend_advertisement::REPLY_INFO;
use strata_wire::{Arg, ArgCursor, Handler, Object, RequestError};
use tracing::debug;

use crate::display::DisplayState;
use crate::session::ClientId;

pub(crate) fn handlers() -> Vec<Handler<DisplayState, ClientId>> {
    vec![request_info]
}

fn request_info(
    state: &mut DisplayState,
    client: ClientId,
    object: Object,
    _args: &mut ArgCursor<'_>,
) -> Result<(), RequestError> {
    let name = state.backend().name().to_owned();
    let args = state.backend().args().to_owned();
    debug!("{} requested backend info: {} '{}'", client, name, args);
    state.post_event(client, object.id, REPLY_INFO, &[Arg::Str(name), Arg::Str(args)]);
    Ok(())
}
