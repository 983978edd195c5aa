use std::path::PathBuf;

use rand::prelude::*;

/// Conduct the per-test initialization: logging only, since every test
/// runs its own engine instance.
pub fn setup() {
    acorn_db::utils::init_log();
}

/// Self-cleaning scratch directory for table files.
pub struct TestDir {
    dir: PathBuf,
}

impl TestDir {
    pub fn new(tag: &str) -> TestDir {
        let dir = std::env::temp_dir().join(format!(
            "acorn-{}-{}-{:x}",
            tag,
            std::process::id(),
            rand::thread_rng().gen::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        TestDir { dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Deterministic value bytes for a key, sized `50 + key % 63`.
pub fn patterned_value(key: i64) -> Vec<u8> {
    let len = 50 + (key % 63) as usize;
    vec![(key ^ (key >> 3)) as u8; len]
}

/// Random value in the accepted 50..=112 byte range.
pub fn random_value(rng: &mut impl Rng) -> Vec<u8> {
    let len = rng.gen_range(50, 113);
    (0..len).map(|_| rng.gen()).collect()
}
