use state_machines::state_machine;

state_machine! {
    name: ChunkMachine,
    state: ChunkState,
    initial: Ready,
    states: [Ready, Cleaned, Built, Budgeted, Persisted, Indexed, Completed],
    events {
        clean { transition: { from: Ready, to: Cleaned } }
        build { transition: { from: Cleaned, to: Built } }
        budget { transition: { from: Built, to: Budgeted } }
        persist { transition: { from: Budgeted, to: Persisted } }
        index { transition: { from: Persisted, to: Indexed } }
        complete { transition: { from: Indexed, to: Completed } }
    }
}

pub fn ready() -> ChunkMachine<(), Ready> {
    ChunkMachine::new(())
}
