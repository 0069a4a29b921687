//! In-process transport: nodes are multi-sessions registered by address.

use std::io::{Cursor, Read};
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use parking_lot::RwLock;

use crate::ftgs::codec::encode_stream;
use crate::remote::{
    CommandResponse, KnownErrorKind, RemoteCommand, RemoteError, RemoteTransport, SplitRequest,
};
use crate::session::MultiSession;

/// Routes requests to [`MultiSession`]s living in this process.
///
/// Split streams are fully encoded before they are handed back, so a
/// reader never holds locks of the serving session.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    nodes: RwLock<AHashMap<String, Arc<MultiSession>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `session` under `node`, replacing any previous one.
    pub fn register<S: Into<String>>(&self, node: S, session: Arc<MultiSession>) {
        self.nodes.write().insert(node.into(), session);
    }

    pub fn unregister(&self, node: &str) -> Option<Arc<MultiSession>> {
        self.nodes.write().remove(node)
    }

    fn session(&self, node: &str, session_id: &str) -> Result<Arc<MultiSession>, RemoteError> {
        let nodes = self.nodes.read();
        match nodes.get(node) {
            Some(session) if session.id() == session_id && !session.is_closed() => {
                Ok(Arc::clone(session))
            }
            Some(_) => Err(RemoteError::known(
                KnownErrorKind::SessionNotFound,
                format!("no session {session_id} on {node}"),
            )),
            None => Err(RemoteError::known(
                KnownErrorKind::SessionNotFound,
                format!("unknown node {node}"),
            )),
        }
    }
}

impl RemoteTransport for LoopbackTransport {
    fn fetch_split(
        &self,
        node: &str,
        session_id: &str,
        request: &SplitRequest,
    ) -> Result<Box<dyn Read + Send>, RemoteError> {
        let session = self.session(node, session_id)?;
        let mut iterator = session.ftgs_iterator_split(request)?;
        let mut buffer = Vec::new();
        let bytes = encode_stream(&mut iterator, &mut buffer)?;
        debug!(
            "Served split {}/{} of {session_id} from {node}: {bytes} bytes",
            request.split_index, request.num_splits
        );
        Ok(Box::new(Cursor::new(buffer)))
    }

    fn execute(
        &self,
        node: &str,
        session_id: &str,
        command: &RemoteCommand,
    ) -> Result<CommandResponse, RemoteError> {
        let session = self.session(node, session_id)?;
        Ok(session.execute_command(command)?)
    }
}
