//! Agent-facing sync and state reporting.

use std::collections::BTreeSet;

use chrono::Utc;
use dynroute_events::{
    AgentStateReport, NetworkRef, PeerDescriptor, ReportStateAck, AGENT_TYPE_DYNAMIC_ROUTING,
};
use tracing::{debug, info, instrument};

use super::{FleetScheduler, SchedulerError};

impl FleetScheduler {
    /// Auto-schedule peers for `host`, then return every peer bound to it.
    ///
    /// Unknown or disabled agents get an empty list.
    #[instrument(skip(self))]
    pub async fn sync_routing_peers(
        &self,
        host: &str,
    ) -> Result<Vec<PeerDescriptor>, SchedulerError> {
        if self.policy.auto_schedule {
            self.auto_schedule_routing_peers(host).await?;
        }

        let Some(agent) = self
            .store
            .find_agent(AGENT_TYPE_DYNAMIC_ROUTING, host)
            .await?
        else {
            return Ok(Vec::new());
        };
        if !agent.admin_state_up {
            return Ok(Vec::new());
        }

        let peers = self.store.peers_on_agent(agent.id).await?;
        debug!(host, peers = peers.len(), "Answered peer sync");
        Ok(peers.iter().map(|p| p.descriptor()).collect())
    }

    /// Auto-schedule an instance for `host`, then return what its first
    /// advertising instance announces: the subnets of its networks followed
    /// by its explicit routes, all with the instance nexthop.
    #[instrument(skip(self))]
    pub async fn sync_advertise_networks(
        &self,
        host: &str,
    ) -> Result<Vec<NetworkRef>, SchedulerError> {
        if self.policy.auto_schedule {
            self.auto_schedule_routing_instances(host).await?;
        }

        let Some(agent) = self
            .store
            .find_agent(AGENT_TYPE_DYNAMIC_ROUTING, host)
            .await?
        else {
            return Ok(Vec::new());
        };
        if !agent.admin_state_up {
            return Ok(Vec::new());
        }

        let instances = self.store.instances_on_agent(agent.id).await?;
        let Some(instance) = instances.into_iter().find(|i| i.advertise) else {
            return Ok(Vec::new());
        };

        let mut seen = BTreeSet::new();
        let mut networks = Vec::new();
        let subnets = self
            .store
            .list_networks(instance.id)
            .await?
            .into_iter()
            .flat_map(|network_id| self.networks.subnets(network_id));

        for cidr in subnets.chain(instance.advertise_routes.iter().copied()) {
            if seen.insert(cidr) {
                networks.push(NetworkRef {
                    cidr,
                    next_hop: instance.nexthop,
                });
            }
        }

        debug!(
            host,
            instance_id = %instance.id,
            networks = networks.len(),
            "Answered advertise-networks sync"
        );
        Ok(networks)
    }

    /// Register or refresh the reporting agent.
    #[instrument(skip(self, report), fields(host = %report.host, agent_type = %report.agent_type))]
    pub async fn report_state(
        &self,
        report: &AgentStateReport,
    ) -> Result<ReportStateAck, SchedulerError> {
        if !self.policy.state_reporting {
            return Err(SchedulerError::ReportingUnsupported);
        }

        let agent = self.store.record_agent_report(report, Utc::now()).await?;
        if report.start_flag {
            info!(agent_id = %agent.id, host = %agent.host, "Agent started");
        }

        Ok(ReportStateAck {
            agent_id: agent.id,
            admin_state_up: agent.admin_state_up,
        })
    }
}
