use kmigrate_lib::consts::{DEFAULT_TRANSFER_IMAGE, MAX_WORKERS};

pub fn cmd_version() {
  println!("kubectl-migrate {}", env!("CARGO_PKG_VERSION"));
  println!("  transfer image: {}", DEFAULT_TRANSFER_IMAGE);
  println!("  max workers: {}", MAX_WORKERS);
}
