use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use futures::future::join_all;
use tracing::debug;

use super::bits::Bitmap;
use super::contact::Contact;
use super::error::DhtError;
use super::message::{Request, ResponsePayload};
use super::node::Node;
use crate::constants::{ALPHA, BUCKET_SIZE};

/// Which RPC an iterative lookup drives toward the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupKind {
    Node,
    Value,
}

/// Outcome of one iterative traversal.
#[derive(Debug, Default)]
pub(crate) struct LookupResult {
    /// The k responsive contacts closest to the target, nearest first.
    /// For an announcer this is the store target set.
    pub closest: Vec<Contact>,
    /// Peers that announced the target hash (value lookups only).
    pub found: Vec<Contact>,
    /// Store tokens gathered along the way, keyed by responder id.
    pub tokens: HashMap<Bitmap, Bytes>,
}

impl Node {
    /// Iteratively walks toward `target`: each round probes the α closest
    /// uncontacted candidates in parallel, merges the contacts they return,
    /// and stops once a round uncovers nothing closer than what was already
    /// known. Value hits are accumulated without cutting the traversal
    /// short, so the closest-contact set is complete for announcers.
    ///
    /// Shutdown cancels the walk and yields whatever was gathered so far.
    pub(crate) async fn iterative_find(
        &self,
        target: Bitmap,
        kind: LookupKind,
    ) -> Result<LookupResult, DhtError> {
        if self.is_shutdown() {
            return Err(DhtError::ShuttingDown);
        }

        let self_id = self.id();
        let mut shutdown = self.shutdown_signal();

        let mut shortlist = self.routing_table().closest(&target, BUCKET_SIZE);
        let mut contacted: HashSet<Bitmap> = HashSet::new();
        let mut responded: Vec<Contact> = Vec::new();
        let mut found: Vec<Contact> = Vec::new();
        let mut found_ids: HashSet<Bitmap> = HashSet::new();
        let mut tokens: HashMap<Bitmap, Bytes> = HashMap::new();

        loop {
            shortlist.sort_by_key(|c| (c.id.distance(&target), c.id));

            let round: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !contacted.contains(&c.id))
                .take(ALPHA)
                .copied()
                .collect();
            if round.is_empty() {
                break;
            }

            // Anything nearer than this after the round means progress.
            let best_before = shortlist.first().map(|c| c.id.distance(&target));

            for contact in &round {
                contacted.insert(contact.id);
            }

            let probes = round.iter().map(|contact| {
                let request = match kind {
                    LookupKind::Node => Request::FindNode { target },
                    LookupKind::Value => Request::FindValue { blob_hash: target },
                };
                async move { (*contact, self.send_request(contact.addr(), request).await) }
            });

            let results = tokio::select! {
                _ = shutdown.changed() => break,
                results = join_all(probes) => results,
            };

            let mut saw_closer = false;
            let mut any_response = false;
            for (contact, result) in results {
                match result {
                    Ok((_, payload)) => {
                        any_response = true;
                        responded.push(contact);

                        let (closer, token, holders) = split_payload(payload);

                        if let Some(token) = token {
                            if !token.is_empty() {
                                tokens.insert(contact.id, token);
                            }
                        }
                        for holder in holders {
                            if found_ids.insert(holder.id) {
                                found.push(holder);
                            }
                        }
                        for candidate in closer {
                            if candidate.id == self_id
                                || shortlist.iter().any(|c| c.id == candidate.id)
                            {
                                continue;
                            }
                            if best_before
                                .is_none_or(|best| candidate.id.distance(&target) < best)
                            {
                                saw_closer = true;
                            }
                            shortlist.push(candidate);
                        }
                    }
                    Err(DhtError::Timeout) => {
                        self.routing_table().record_failure(&contact.id);
                    }
                    Err(DhtError::ShuttingDown) => break,
                    Err(e) => {
                        debug!("lookup probe to {} failed: {}", contact.addr(), e);
                    }
                }
            }

            // Converged: answers came back and none of them moved us closer.
            // A round of pure timeouts keeps walking the remaining
            // candidates instead.
            if any_response && !saw_closer {
                break;
            }
        }

        responded.sort_by_key(|c| (c.id.distance(&target), c.id));
        responded.truncate(BUCKET_SIZE);

        Ok(LookupResult {
            closest: responded,
            found,
            tokens,
        })
    }
}

/// Splits a probe response into (closer contacts, token, value holders).
fn split_payload(payload: ResponsePayload) -> (Vec<Contact>, Option<Bytes>, Vec<Contact>) {
    match payload {
        ResponsePayload::Contacts(contacts) => (contacts, None, Vec::new()),
        ResponsePayload::CloserContacts { contacts, token } => (contacts, Some(token), Vec::new()),
        ResponsePayload::Value {
            contacts, token, ..
        } => (Vec::new(), Some(token), contacts),
        ResponsePayload::Pong | ResponsePayload::StoreOk => (Vec::new(), None, Vec::new()),
    }
}
