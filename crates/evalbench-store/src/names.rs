use uuid::Uuid;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "calm", "clever", "crisp", "eager", "fancy", "gentle", "golden",
    "happy", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "proud", "quiet", "rapid",
    "shiny", "silent", "swift", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "comet", "falcon", "fern", "harbor", "heron", "lantern", "maple", "meadow", "otter",
    "panda", "pebble", "quartz", "raven", "river", "sparrow", "summit", "thistle", "tiger",
    "tulip", "walrus", "willow", "wren", "zephyr",
];

/// Random 12-hex-character id. Contains no `_`, so `{name}_{id}` splits cleanly.
pub fn generate_run_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

/// Human-memorable two-word name such as `swift-falcon`.
pub fn generate_run_name() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let noun = NOUNS[bytes[1] as usize % NOUNS.len()];
    format!("{adjective}-{noun}")
}
