// ferret - coverage-guided fuzzing for EVM smart contracts
// Copyright (C) 2026 ferret contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Fuzzing workers.
//!
//! A worker owns a private test chain deployed from the configured
//! contract definitions and runs the sequence loop: generate, execute,
//! fan out post-call checks, shrink, publish to the corpus, revert to the
//! base snapshot. Shared campaign state arrives explicitly through
//! [`Services`].

use crate::{
    chain::{ContractEvent, Evm, FuzzerState, TestChain},
    config::FuzzerConfig,
    contracts::{ContractDefinition, DeployedContract},
    corpus::Corpus,
    coverage::CoverageMaps,
    executor::execute_call_sequence,
    metrics::{CampaignMetrics, WorkerMetrics},
    mutator::{FuzzableMethod, MutationContext, Mutator, RandomMutator},
    sequence::{CallSequence, CallSequenceElement},
    shrink::shrink_sequence,
    testing::{
        AssertionTestProvider, OptimizationTestProvider, PropertyTestProvider, ShrinkGoal,
        ShrinkRequest, TestCaseRegistry, TestProvider,
    },
};
use alloy_primitives::Address;
use ferret_fork::StateBackend;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Builds the forked state a fresh worker chain starts from.
pub trait StateFactory: Send + Sync {
    /// A fresh state over the campaign's backend.
    fn create_state(&self) -> FuzzerState;
}

/// The stock factory: every chain gets a fresh state over one shared
/// backend (and thereby the shared RPC cache).
pub struct BackendStateFactory {
    backend: Arc<dyn StateBackend>,
}

impl BackendStateFactory {
    /// New factory over `backend`.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }
}

impl StateFactory for BackendStateFactory {
    fn create_state(&self) -> FuzzerState {
        FuzzerState::new(self.backend.clone())
    }
}

/// Builds the EVM instance a fresh worker chain executes with.
pub trait EvmFactory: Send + Sync {
    /// A fresh EVM.
    fn create_evm(&self) -> Box<dyn Evm>;
}

/// Shared campaign resources, passed to every worker at construction.
pub struct Services {
    /// The shared corpus.
    pub corpus: Corpus,
    /// Campaign-wide coverage maps.
    pub coverage: CoverageMaps,
    /// The shared test-case registry.
    pub registry: TestCaseRegistry,
    /// Campaign counters.
    pub metrics: CampaignMetrics,
    cancelled: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl Services {
    /// New services around a corpus, with a private shutdown channel.
    pub fn new(corpus: Corpus) -> Self {
        Self::with_shutdown(corpus, broadcast::channel(1).0)
    }

    /// New services sharing an external shutdown channel, so that
    /// cancelling the campaign also aborts inflight backend requests.
    pub fn with_shutdown(corpus: Corpus, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            corpus,
            coverage: CoverageMaps::new(),
            registry: TestCaseRegistry::new(),
            metrics: CampaignMetrics::new(),
            cancelled: AtomicBool::new(false),
            shutdown,
        }
    }

    /// The process-wide shutdown channel; backends subscribe to it.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Cancel the campaign: workers unwind within a bounded number of
    /// calls, inflight RPC requests abort.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("Campaign cancellation requested");
            let _ = self.shutdown.send(());
        }
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Why a worker returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker hit its reset limit; respawn it on a fresh chain.
    ResetLimit,
    /// The campaign is over (cancellation or test limit).
    Finished,
}

/// One fuzzing worker. Runs synchronously on its own thread.
pub struct FuzzerWorker {
    index: usize,
    seed: u64,
    config: Arc<FuzzerConfig>,
    contracts: Vec<Arc<ContractDefinition>>,
    services: Arc<Services>,
    state_factory: Arc<dyn StateFactory>,
    evm_factory: Arc<dyn EvmFactory>,
}

impl FuzzerWorker {
    /// New worker for slot `index`.
    pub fn new(
        index: usize,
        seed: u64,
        config: Arc<FuzzerConfig>,
        contracts: Vec<Arc<ContractDefinition>>,
        services: Arc<Services>,
        state_factory: Arc<dyn StateFactory>,
        evm_factory: Arc<dyn EvmFactory>,
    ) -> Self {
        Self { index, seed, config, contracts, services, state_factory, evm_factory }
    }

    /// Run the worker until its reset limit, the campaign's test limit,
    /// or cancellation.
    pub fn run(self) -> eyre::Result<WorkerExit> {
        let config = &self.config;
        let services = &self.services;
        debug!(worker = self.index, seed = self.seed, "Worker starting");

        let mut chain = TestChain::new(
            self.evm_factory.create_evm(),
            self.state_factory.create_state(),
            config.block_gas_limit,
        );

        let mut providers = self.make_providers();
        let mut known_contracts: HashSet<Address> = HashSet::new();
        let mut methods: Vec<FuzzableMethod> = Vec::new();

        // Chain setup: deploy the configured definitions in order and
        // register their test methods.
        for definition in self.ordered_contracts() {
            let address = match chain.deploy_contract(&definition, config.deployer_address) {
                Ok(address) => address,
                Err(e) => {
                    // Setup failures repeat on every respawn; stop the
                    // campaign instead of thrashing the slot.
                    services.cancel();
                    return Err(eyre::eyre!("failed to deploy {}: {e}", definition.name));
                }
            };
            let deployed = DeployedContract { address, definition: definition.clone() };

            for provider in providers.iter_mut() {
                provider.on_contract_deployed(&services.registry, &deployed);
            }
            self.collect_fuzzable_methods(&deployed, &mut methods);
            known_contracts.insert(address);
            info!(worker = self.index, contract = %definition.name, %address, "Deployed contract");
        }
        chain.commit_pending_block();
        chain.drain_events();

        if methods.is_empty() {
            warn!(worker = self.index, "No fuzzable methods; stopping the campaign");
            services.cancel();
            return Ok(WorkerExit::Finished);
        }

        // Sequences execute on top of this snapshot and unwind back to
        // it, bounding state growth between worker resets.
        let base_snap = chain.snapshot();
        let mut mutator = RandomMutator::new(self.seed);
        let mut local = WorkerMetrics::default();

        let exit = loop {
            if services.is_cancelled() {
                break WorkerExit::Finished;
            }
            if config.test_limit > 0 && services.metrics.calls_tested() >= config.test_limit {
                services.cancel();
                break WorkerExit::Finished;
            }
            if local.sequences_tested >= config.worker_reset_limit {
                services.metrics.record_worker_reset();
                break WorkerExit::ResetLimit;
            }

            let generated = {
                let ctx = MutationContext {
                    corpus: &services.corpus,
                    methods: &methods,
                    senders: &config.sender_addresses,
                    max_length: config.call_sequence_length,
                    gas_limit: config.transaction_gas_limit,
                };
                mutator.generate(&ctx)
            };
            if generated.is_empty() {
                continue;
            }

            let delta = self.run_sequence(
                &mut chain,
                &mut providers,
                &mut known_contracts,
                base_snap,
                generated,
            );

            local.sequences_tested += 1;
            local.calls_tested += delta.calls_tested;
            local.shrink_executions += delta.shrink_executions;
            services.metrics.flush_worker(WorkerMetrics {
                sequences_tested: 1,
                ..delta
            });
        };

        debug!(worker = self.index, sequences = local.sequences_tested, "Worker exiting");
        Ok(exit)
    }

    /// Execute one generated sequence with post-call checks, process the
    /// resulting shrink requests, publish corpus feedback and revert the
    /// chain to the base snapshot.
    fn run_sequence(
        &self,
        chain: &mut TestChain<Box<dyn Evm>>,
        providers: &mut [Box<dyn TestProvider>],
        known_contracts: &mut HashSet<Address>,
        base_snap: ferret_fork::SnapId,
        generated: CallSequence,
    ) -> WorkerMetrics {
        let services = &self.services;
        let elements = generated.elements;

        let mut shrink_requests: Vec<ShrinkRequest> = Vec::new();
        let mut session_contracts: Vec<Address> = Vec::new();
        let mut new_coverage = false;

        let (executed, error) = execute_call_sequence(
            chain,
            |i| elements.get(i).map(CallSequenceElement::without_results),
            Some(|chain: &mut TestChain<Box<dyn Evm>>, executed: &[CallSequenceElement]| {
                if let Some(outcome) = executed.last().and_then(|e| e.outcome.as_ref()) {
                    if services.coverage.update(&outcome.coverage) {
                        new_coverage = true;
                    }
                }

                // Contracts deployed mid-sequence join the test surface
                // until the sequence unwinds.
                for event in chain.drain_events() {
                    match event {
                        ContractEvent::Deployed { address } => {
                            if !known_contracts.insert(address) {
                                continue;
                            }
                            if let Some(deployed) =
                                self.match_deployed_contract(chain, address)
                            {
                                for provider in providers.iter_mut() {
                                    provider
                                        .on_contract_deployed(&services.registry, &deployed);
                                }
                                session_contracts.push(address);
                            }
                        }
                        ContractEvent::Removed { address } => {
                            known_contracts.remove(&address);
                            for provider in providers.iter_mut() {
                                provider.on_contract_removed(&services.registry, address);
                            }
                        }
                    }
                }

                for provider in providers.iter_mut() {
                    let requests =
                        provider.check_post_call(chain, &services.registry, executed)?;
                    shrink_requests.extend(requests);
                }
                Ok(!shrink_requests.is_empty())
            }),
        );

        if let Some(err) = error {
            // The sequence died (transport failure, fatal EVM error);
            // the worker itself survives.
            warn!(worker = self.index, %err, "Sequence terminated early");
        }

        let mut delta = WorkerMetrics {
            sequences_tested: 0,
            calls_tested: executed.len() as u64,
            shrink_executions: 0,
        };

        for request in shrink_requests {
            if services.is_cancelled() {
                break;
            }
            delta.shrink_executions +=
                self.process_shrink_request(chain, base_snap, &executed, request);
        }

        if new_coverage {
            services.corpus.add(&CallSequence::new(executed));
        }

        chain.revert_to_snapshot(base_snap);
        chain.drain_events();

        // The unwind removed everything deployed during the sequence.
        for address in session_contracts {
            known_contracts.remove(&address);
            for provider in providers.iter_mut() {
                provider.on_contract_removed(&services.registry, address);
            }
        }

        delta
    }

    /// Shrink against the request's goal and publish the result to the
    /// registry and the corpus. Returns the executions spent.
    fn process_shrink_request(
        &self,
        chain: &mut TestChain<Box<dyn Evm>>,
        base_snap: ferret_fork::SnapId,
        executed: &[CallSequenceElement],
        request: ShrinkRequest,
    ) -> u64 {
        let services = &self.services;
        let outcome = shrink_sequence(
            chain,
            base_snap,
            executed.to_vec(),
            &request.goal,
            self.config.shrink_limit,
        );

        match &request.goal {
            ShrinkGoal::PropertyFails { .. } => {
                services.registry.mark_failed(
                    &request.test_id,
                    "property predicate reverted or returned false",
                    outcome.sequence.clone(),
                    outcome.trace.clone(),
                );
            }
            ShrinkGoal::CallPanics { .. } => {
                services.registry.mark_failed(
                    &request.test_id,
                    "call tripped a configured panic code",
                    outcome.sequence.clone(),
                    outcome.trace.clone(),
                );
            }
            ShrinkGoal::ValueAtLeast { target, .. } => {
                let value = outcome.value.unwrap_or(*target);
                services.registry.update_optimum(
                    &request.test_id,
                    value,
                    outcome.sequence.clone(),
                    outcome.trace.clone(),
                );
            }
        }

        services.corpus.add(&outcome.sequence);
        outcome.executions
    }

    /// Match a mid-sequence deployment back to a known definition by its
    /// deployed code.
    fn match_deployed_contract(
        &self,
        chain: &mut TestChain<Box<dyn Evm>>,
        address: Address,
    ) -> Option<DeployedContract> {
        let code = chain.code_at(address).ok()?;
        if code.is_empty() {
            return None;
        }
        let definition = self.contracts.iter().find(|def| def.bytecode == code)?;
        Some(DeployedContract { address, definition: definition.clone() })
    }

    fn ordered_contracts(&self) -> Vec<Arc<ContractDefinition>> {
        if self.config.deployment_order.is_empty() {
            return self.contracts.clone();
        }
        self.config
            .deployment_order
            .iter()
            .filter_map(|name| self.contracts.iter().find(|def| def.name == *name).cloned())
            .collect()
    }

    fn collect_fuzzable_methods(
        &self,
        deployed: &DeployedContract,
        methods: &mut Vec<FuzzableMethod>,
    ) {
        let test_prefixes = self.config.testing.test_method_prefixes();
        for method in &deployed.definition.methods {
            if test_prefixes.iter().any(|prefix| method.name.starts_with(prefix.as_str())) {
                continue;
            }
            methods.push(FuzzableMethod {
                contract: deployed.name().to_string(),
                address: deployed.address,
                method: method.clone(),
            });
        }
    }

    fn make_providers(&self) -> Vec<Box<dyn TestProvider>> {
        let testing = &self.config.testing;
        let sender = self
            .config
            .sender_addresses
            .first()
            .copied()
            .unwrap_or(crate::config::DEFAULT_SENDERS[0]);
        vec![
            Box::new(PropertyTestProvider::new(
                testing.property_prefixes.clone(),
                sender,
                self.config.transaction_gas_limit,
            )),
            Box::new(OptimizationTestProvider::new(
                testing.optimization_prefixes.clone(),
                sender,
                self.config.transaction_gas_limit,
            )),
            Box::new(AssertionTestProvider::new(
                testing.assertion.clone(),
                testing.test_method_prefixes(),
            )),
        ]
    }
}
