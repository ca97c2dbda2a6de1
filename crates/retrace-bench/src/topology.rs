// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The service topology: which APIs each service exposes, how much CPU
//! work an API performs, and which child calls it may fan out to.
//! Immutable after construction.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::work::MatrixConfig;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("service {0} not found in topology")]
    ServiceNotFound(String),
    #[error("outcall target {0} has no address entry")]
    UnknownChildService(String),
    #[error("probability {probability} for outcall {service}:{api} is out of range 0..=100")]
    BadProbability {
        service: String,
        api: String,
        probability: i64,
    },
    #[error("invalid benchmarks row {row:?}")]
    BadBenchmarkRow { row: String },
}

#[derive(Debug, Deserialize)]
struct RawTopology {
    services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    name: String,
    apis: Vec<RawApi>,
}

#[derive(Debug, Deserialize)]
struct RawApi {
    name: String,
    exec: f64,
    #[serde(default)]
    children: Vec<RawChild>,
}

#[derive(Debug, Deserialize)]
struct RawChild {
    service: String,
    api: String,
    probability: i64,
}

#[derive(Debug, Deserialize)]
struct RawAddresses {
    addresses: Vec<RawAddress>,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
    name: String,
    deploy_addr: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    port: Option<String>,
    #[serde(default)]
    agent_port: Option<String>,
    #[serde(default)]
    instances: Option<Vec<RawInstance>>,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    hostname: String,
    port: String,
    agent_port: String,
}

/// Deployment addresses for one service: one entry per instance. The
/// breadcrumb (`hostname:agent_port`) names the instance's agent.
#[derive(Debug, Clone)]
pub struct AddressInfo {
    pub name: String,
    pub deploy_addr: String,
    pub ports: Vec<String>,
    pub agent_ports: Vec<String>,
    pub connection_addresses: Vec<String>,
    pub breadcrumbs: Vec<String>,
}

impl AddressInfo {
    pub fn num_instances(&self) -> usize {
        self.connection_addresses.len()
    }
}

pub type AddressMap = HashMap<String, AddressInfo>;

/// A potential outgoing call to an API in a different service. For
/// multi-instance targets, `subcalls` holds one single-instance outcall
/// per instance and the caller picks one uniformly at random.
#[derive(Debug, Clone)]
pub struct Outcall {
    pub service_name: String,
    pub api_name: String,
    /// Percentage in 0..=100 of being invoked per execution.
    pub probability: i64,
    pub server_addr: String,
    pub breadcrumb: String,
    pub subcalls: Vec<Outcall>,
}

impl Outcall {
    fn new(child: &RawChild, info: &AddressInfo) -> Outcall {
        if info.num_instances() == 1 {
            Outcall {
                service_name: child.service.clone(),
                api_name: child.api.clone(),
                probability: child.probability,
                server_addr: info.connection_addresses[0].clone(),
                breadcrumb: info.breadcrumbs[0].clone(),
                subcalls: Vec::new(),
            }
        } else {
            let subcalls = info
                .connection_addresses
                .iter()
                .zip(info.breadcrumbs.iter())
                .map(|(addr, breadcrumb)| Outcall {
                    service_name: child.service.clone(),
                    api_name: child.api.clone(),
                    probability: child.probability,
                    server_addr: addr.clone(),
                    breadcrumb: breadcrumb.clone(),
                    subcalls: Vec::new(),
                })
                .collect();
            Outcall {
                service_name: child.service.clone(),
                api_name: child.api.clone(),
                probability: child.probability,
                server_addr: String::new(),
                breadcrumb: String::new(),
                subcalls,
            }
        }
    }
}

/// An API provided by a service.
#[derive(Debug, Clone)]
pub struct Api {
    pub name: String,
    /// Target CPU-work time, matched against the benchmarks table.
    pub exec: f64,
    pub children: Vec<Outcall>,
}

/// One service's slice of the topology, plus the matrix dimensions
/// resolved for each of its APIs.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    apis: HashMap<String, Api>,
    matrix_configs: HashMap<String, MatrixConfig>,
}

impl ServiceConfig {
    pub fn get_api(&self, name: &str) -> Option<&Api> {
        self.apis.get(name)
    }

    pub fn apis(&self) -> &HashMap<String, Api> {
        &self.apis
    }

    pub fn api_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apis.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn matrix_config(&self, api: &str) -> MatrixConfig {
        self.matrix_configs.get(api).copied().unwrap_or_default()
    }

    /// Resolves each API's `exec` target to the benchmarks row whose
    /// measured time is closest; the first-seen row wins ties.
    pub fn generate_matrix_configs(&mut self, benchmarks_csv: &str) -> Result<(), TopologyError> {
        let rows = parse_benchmarks(benchmarks_csv)?;
        if rows.is_empty() {
            return Ok(());
        }
        for (name, api) in &self.apis {
            let mut best: Option<(f64, MatrixConfig)> = None;
            for (time_ms, config) in &rows {
                let distance = (api.exec - time_ms).abs();
                if best.map_or(true, |(d, _)| distance < d) {
                    best = Some((distance, *config));
                }
            }
            if let Some((_, config)) = best {
                self.matrix_configs.insert(name.clone(), config);
            }
        }
        Ok(())
    }

    pub fn print_matrix_configs(&self) {
        for (api, config) in &self.matrix_configs {
            info!(
                "Config for api {api} is: ({}, {}, {})",
                config.m, config.n, config.k
            );
        }
    }
}

fn parse_benchmarks(csv: &str) -> Result<Vec<(f64, MatrixConfig)>, TopologyError> {
    let mut rows = Vec::new();
    for line in csv.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let parsed = (|| {
            let m = fields.first()?.parse().ok()?;
            let n = fields.get(1)?.parse().ok()?;
            let k = fields.get(2)?.parse().ok()?;
            let time_ms: f64 = fields.get(3)?.parse().ok()?;
            Some((time_ms, MatrixConfig { m, n, k }))
        })();
        match parsed {
            Some(row) => rows.push(row),
            None => {
                return Err(TopologyError::BadBenchmarkRow {
                    row: line.to_string(),
                })
            }
        }
    }
    Ok(rows)
}

/// Parses the addresses file into per-service instance address lists.
pub fn parse_addresses(json: &str) -> Result<AddressMap, TopologyError> {
    let raw: RawAddresses = serde_json::from_str(json)?;
    let mut map = AddressMap::new();
    for entry in raw.addresses {
        let info = match entry.instances {
            Some(instances) => AddressInfo {
                name: entry.name.clone(),
                deploy_addr: entry.deploy_addr,
                ports: instances.iter().map(|i| i.port.clone()).collect(),
                agent_ports: instances.iter().map(|i| i.agent_port.clone()).collect(),
                connection_addresses: instances
                    .iter()
                    .map(|i| format!("{}:{}", i.hostname, i.port))
                    .collect(),
                breadcrumbs: instances
                    .iter()
                    .map(|i| format!("{}:{}", i.hostname, i.agent_port))
                    .collect(),
            },
            None => {
                let hostname = entry.hostname.unwrap_or_default();
                let port = entry.port.unwrap_or_default();
                let agent_port = entry.agent_port.unwrap_or_default();
                AddressInfo {
                    name: entry.name.clone(),
                    deploy_addr: entry.deploy_addr,
                    connection_addresses: vec![format!("{hostname}:{port}")],
                    breadcrumbs: vec![format!("{hostname}:{agent_port}")],
                    ports: vec![port],
                    agent_ports: vec![agent_port],
                }
            }
        };
        map.insert(entry.name, info);
    }
    Ok(map)
}

/// Extracts the configuration of one service from the topology file,
/// resolving each outcall's target addresses.
pub fn service_config(
    json: &str,
    service_name: &str,
    addresses: &AddressMap,
) -> Result<ServiceConfig, TopologyError> {
    let raw: RawTopology = serde_json::from_str(json)?;
    let service = raw
        .services
        .into_iter()
        .find(|s| s.name == service_name)
        .ok_or_else(|| TopologyError::ServiceNotFound(service_name.to_string()))?;

    let mut apis = HashMap::new();
    for api in service.apis {
        let mut children = Vec::new();
        for child in &api.children {
            if !(0..=100).contains(&child.probability) {
                return Err(TopologyError::BadProbability {
                    service: child.service.clone(),
                    api: child.api.clone(),
                    probability: child.probability,
                });
            }
            let info = addresses
                .get(&child.service)
                .ok_or_else(|| TopologyError::UnknownChildService(child.service.clone()))?;
            children.push(Outcall::new(child, info));
        }
        apis.insert(
            api.name.clone(),
            Api {
                name: api.name,
                exec: api.exec,
                children,
            },
        );
    }

    Ok(ServiceConfig {
        name: service.name,
        apis,
        matrix_configs: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESSES: &str = r#"{
        "addresses": [
            {"name": "service1", "deploy_addr": "0.0.0.0", "hostname": "127.0.0.1",
             "port": "5001", "agent_port": "7001"},
            {"name": "service2", "deploy_addr": "0.0.0.0", "instances": [
                {"hostname": "127.0.0.1", "port": "5002", "agent_port": "7002"},
                {"hostname": "127.0.0.1", "port": "5003", "agent_port": "7003"}
            ]}
        ]
    }"#;

    const TOPOLOGY: &str = r#"{
        "services": [
            {"name": "service1", "apis": [
                {"name": "api1", "exec": 10, "children": [
                    {"service": "service2", "api": "api2", "probability": 50}
                ]}
            ]},
            {"name": "service2", "apis": [
                {"name": "api2", "exec": 5, "children": []}
            ]}
        ]
    }"#;

    #[test]
    fn addresses_expand_instances() {
        let addresses = parse_addresses(ADDRESSES).unwrap();
        let single = &addresses["service1"];
        assert_eq!(single.connection_addresses, vec!["127.0.0.1:5001"]);
        assert_eq!(single.breadcrumbs, vec!["127.0.0.1:7001"]);

        let multi = &addresses["service2"];
        assert_eq!(multi.num_instances(), 2);
        assert_eq!(multi.connection_addresses[1], "127.0.0.1:5003");
        assert_eq!(multi.breadcrumbs[1], "127.0.0.1:7003");
    }

    #[test]
    fn multi_instance_targets_expand_to_subcalls() {
        let addresses = parse_addresses(ADDRESSES).unwrap();
        let config = service_config(TOPOLOGY, "service1", &addresses).unwrap();
        let api = config.get_api("api1").unwrap();
        assert_eq!(api.children.len(), 1);
        let child = &api.children[0];
        assert_eq!(child.subcalls.len(), 2);
        assert_eq!(child.subcalls[0].server_addr, "127.0.0.1:5002");
        assert_eq!(child.subcalls[0].breadcrumb, "127.0.0.1:7002");
        assert!(child.subcalls.iter().all(|s| s.probability == 50));
    }

    #[test]
    fn unknown_service_is_an_error() {
        let addresses = parse_addresses(ADDRESSES).unwrap();
        assert!(matches!(
            service_config(TOPOLOGY, "nope", &addresses),
            Err(TopologyError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn unknown_child_target_is_an_error() {
        let topology = r#"{"services": [
            {"name": "service1", "apis": [
                {"name": "api1", "exec": 1, "children": [
                    {"service": "ghost", "api": "x", "probability": 10}
                ]}
            ]}
        ]}"#;
        let addresses = parse_addresses(ADDRESSES).unwrap();
        assert!(matches!(
            service_config(topology, "service1", &addresses),
            Err(TopologyError::UnknownChildService(_))
        ));
    }

    #[test]
    fn out_of_range_probability_is_an_error() {
        let topology = r#"{"services": [
            {"name": "service1", "apis": [
                {"name": "api1", "exec": 1, "children": [
                    {"service": "service2", "api": "api2", "probability": 101}
                ]}
            ]}
        ]}"#;
        let addresses = parse_addresses(ADDRESSES).unwrap();
        assert!(matches!(
            service_config(topology, "service1", &addresses),
            Err(TopologyError::BadProbability { .. })
        ));
    }

    #[test]
    fn nearest_benchmark_row_wins() {
        let addresses = parse_addresses(ADDRESSES).unwrap();
        let mut config = service_config(TOPOLOGY, "service1", &addresses).unwrap();
        let csv = "m,n,k,time_ms\n10,10,10,2.0\n50,50,50,9.0\n100,100,100,40.0\n";
        config.generate_matrix_configs(csv).unwrap();
        // api1 exec=10 is closest to the 9.0ms row.
        assert_eq!(config.matrix_config("api1").m, 50);
        // Unresolved APIs fall back to the default dimensions.
        assert_eq!(config.matrix_config("ghost").m, 50);
    }

    #[test]
    fn benchmark_ties_keep_first_row() {
        let addresses = parse_addresses(ADDRESSES).unwrap();
        let mut config = service_config(TOPOLOGY, "service1", &addresses).unwrap();
        // exec=10 is equidistant from 8.0 and 12.0.
        let csv = "m,n,k,time_ms\n11,11,11,8.0\n22,22,22,12.0\n";
        config.generate_matrix_configs(csv).unwrap();
        assert_eq!(config.matrix_config("api1").m, 11);
    }
}
