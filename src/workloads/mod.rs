//! Reference fan-out/fan-in workloads plugged in through the registries.

pub mod char_count;
pub mod primes;

use crate::runtime::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};

pub use char_count::{aggregate_results, process_work_item, CharCounts};
pub use primes::{count_primes_in_range, is_prime, partition_range, partition_range_clamped, Boundary, PrimesInput};

/// Register `ProcessWorkItem`, `AggregateResults` and `CalculatePrimes`.
pub fn register_activities(builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
    builder
        .register(char_count::PROCESS_WORK_ITEM_ACTIVITY, char_count::process_work_item_activity)
        .register_typed(char_count::AGGREGATE_RESULTS_ACTIVITY, char_count::aggregate_results_activity)
        .register_typed(primes::CALCULATE_PRIMES_ACTIVITY, primes::calculate_primes_activity)
}

/// Register `ParallelProcessingOrchestration` and `PrimesOrchestration`.
pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder
        .register_typed(
            char_count::PARALLEL_PROCESSING_ORCHESTRATION,
            char_count::parallel_processing,
        )
        .register_typed(primes::PRIMES_ORCHESTRATION, primes::primes)
}
