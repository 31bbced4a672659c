mod constants;
mod generator;

use std::sync::Arc;

use coherence::membackend::VecMemory;
use coherence::{Type1Engine, Type2Engine};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if !constants::generators_enabled() {
        tracing::info!("HARNESS_GENERATORS_ENABLED=0, exiting without starting generators");
        return;
    }

    let type1 = Arc::new(Type1Engine::new(VecMemory::new(constants::TYPE1_BACKEND_SIZE)));
    let type2 = Arc::new(Type2Engine::new(VecMemory::new(constants::TYPE2_BACKEND_SIZE)));

    tracing::info!("starting traffic generators");

    let handles = vec![
        std::thread::spawn({
            let engine = Arc::clone(&type1);
            move || generator::type1_host(engine, constants::TYPE1_BACKEND_SIZE as u64)
        }),
        std::thread::spawn({
            let engine = Arc::clone(&type1);
            move || generator::type1_device(engine, constants::TYPE1_BACKEND_SIZE as u64)
        }),
        std::thread::spawn({
            let engine = Arc::clone(&type2);
            move || generator::type2_host(engine)
        }),
        std::thread::spawn({
            let engine = Arc::clone(&type2);
            move || generator::type2_device(engine)
        }),
    ];

    for handle in handles {
        handle.join().expect("generator thread panicked");
    }
}
