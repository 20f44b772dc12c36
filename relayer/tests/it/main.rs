mod destination;
mod listener;
mod subscriber;

use icm_relayer::crypto::Id;

fn blockchain_id() -> Id {
    Id([0xab; 32])
}
