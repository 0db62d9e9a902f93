/*!
# Nervous DevKit - Doublures de test pour le nervous system

- Broker en mémoire implémentant `Broker` (pannes simulables)
- Harness qui démarre une ruche complète avec des temporisations courtes
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::MockBroker;
pub use test_utils::{wait_until, TestHarness, WAIT};
