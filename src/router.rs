//! Remote service table.
//!
//! Holds the latest discovery snapshot of the other tier's instances. The
//! whole table is rebuilt on every snapshot and swapped in atomically with
//! `ArcSwap`, so readers see either the old table or the new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::{Event, State};
use crate::registry::{Endpoint, ServiceInstance};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("not found route: {0}")]
    NotFoundRoute(i32),
    #[error("not found event: {0}")]
    NotFoundEvent(Event),
    #[error("not found endpoint: {0}")]
    NotFoundEndpoint(String),
}

/// Instances able to serve one route or event.
#[derive(Debug)]
struct Candidates {
    stateful: bool,
    /// Selectable instance ids, sorted
    instances: Vec<String>,
    cursor: AtomicUsize,
}

impl Candidates {
    fn new(stateful: bool) -> Self {
        Self {
            stateful,
            instances: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn seal(&mut self) {
        self.instances.sort();
        self.instances.dedup();
        if !self.instances.is_empty() {
            let start = rand::thread_rng().gen_range(0..self.instances.len());
            self.cursor = AtomicUsize::new(start);
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    endpoints: HashMap<String, Endpoint>,
    routes: HashMap<i32, Arc<Candidates>>,
    events: HashMap<Event, Arc<Candidates>>,
}

/// A route or event resolved against one table snapshot.
#[derive(Debug, Clone)]
pub struct Resolved {
    table: Arc<Table>,
    candidates: Arc<Candidates>,
}

impl Resolved {
    pub fn stateful(&self) -> bool {
        self.candidates.stateful
    }

    /// Ids of every instance able to serve this route.
    pub fn instances(&self) -> &[String] {
        &self.candidates.instances
    }

    /// Endpoint of a specific instance, which must serve this route.
    pub fn find_endpoint(&self, insid: &str) -> Result<Endpoint, RouterError> {
        if !self.candidates.instances.iter().any(|id| id == insid) {
            return Err(RouterError::NotFoundEndpoint(insid.to_string()));
        }
        self.table
            .endpoints
            .get(insid)
            .cloned()
            .ok_or_else(|| RouterError::NotFoundEndpoint(insid.to_string()))
    }

    /// Pick the next instance round-robin.
    pub fn select(&self) -> Result<(String, Endpoint), RouterError> {
        let instances = &self.candidates.instances;
        if instances.is_empty() {
            return Err(RouterError::NotFoundEndpoint(String::new()));
        }

        let index = self.candidates.cursor.fetch_add(1, Ordering::Relaxed) % instances.len();
        let insid = &instances[index];
        let endpoint = self
            .table
            .endpoints
            .get(insid)
            .cloned()
            .ok_or_else(|| RouterError::NotFoundEndpoint(insid.clone()))?;

        Ok((insid.clone(), endpoint))
    }
}

#[derive(Debug, Default)]
pub struct Router {
    table: ArcSwap<Table>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the table from a full snapshot and swap it in.
    ///
    /// Instances with a malformed endpoint are skipped. Only working or busy
    /// instances are selectable for routes and events; every instance stays
    /// reachable by id.
    pub fn replace_services(&self, services: &[ServiceInstance]) {
        let mut table = Table::default();
        let mut routes: HashMap<i32, Candidates> = HashMap::new();
        let mut events: HashMap<Event, Candidates> = HashMap::new();

        for service in services {
            let endpoint = match service.endpoint.parse::<Endpoint>() {
                Ok(ep) => ep,
                Err(e) => {
                    warn!(id = %service.id, error = %e, "Skipping service instance");
                    continue;
                }
            };
            table.endpoints.insert(service.id.clone(), endpoint);

            if !matches!(service.state, State::Work | State::Busy) {
                continue;
            }

            for route in &service.routes {
                let entry = routes
                    .entry(route.id)
                    .or_insert_with(|| Candidates::new(route.stateful));
                if entry.stateful != route.stateful {
                    warn!(
                        route = route.id,
                        id = %service.id,
                        "Route statefulness differs between instances"
                    );
                }
                entry.instances.push(service.id.clone());
            }

            for event in &service.events {
                events
                    .entry(*event)
                    .or_insert_with(|| Candidates::new(false))
                    .instances
                    .push(service.id.clone());
            }
        }

        table.routes = routes
            .into_iter()
            .map(|(id, mut c)| {
                c.seal();
                (id, Arc::new(c))
            })
            .collect();
        table.events = events
            .into_iter()
            .map(|(event, mut c)| {
                c.seal();
                (event, Arc::new(c))
            })
            .collect();

        debug!(
            instances = table.endpoints.len(),
            routes = table.routes.len(),
            events = table.events.len(),
            "Replaced service table"
        );

        self.table.store(Arc::new(table));
    }

    pub fn find_endpoint(&self, insid: &str) -> Result<Endpoint, RouterError> {
        self.table
            .load()
            .endpoints
            .get(insid)
            .cloned()
            .ok_or_else(|| RouterError::NotFoundEndpoint(insid.to_string()))
    }

    pub fn find_route(&self, route: i32) -> Result<Resolved, RouterError> {
        let table = self.table.load_full();
        let candidates = table
            .routes
            .get(&route)
            .cloned()
            .ok_or(RouterError::NotFoundRoute(route))?;
        Ok(Resolved { table, candidates })
    }

    pub fn find_event(&self, event: Event) -> Result<Resolved, RouterError> {
        let table = self.table.load_full();
        let candidates = table
            .events
            .get(&event)
            .cloned()
            .ok_or(RouterError::NotFoundEvent(event))?;
        Ok(Resolved { table, candidates })
    }

    /// Ids of every known instance.
    pub fn instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table.load().endpoints.keys().cloned().collect();
        ids.sort();
        ids
    }
}
