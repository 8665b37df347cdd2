use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use qrportal::boards::{self, Board};
use qrportal::captive_portal::{DiskRoot, Reactor};
use qrportal::Setting;

fn main() -> anyhow::Result<()> {
    boards::init_logger();
    let mut board = Board::take()?;

    // safeguard if everything went bananas
    let r = panic::catch_unwind(AssertUnwindSafe(|| run(&mut board)));
    match r {
        Ok(Ok(())) => log::error!("Reactor stopped unexpectedly"),
        Ok(Err(e)) => log::error!("Fatal: {:?}", e),
        Err(_) => log::error!("Fatal: reactor panicked"),
    }

    board.fault_loop()
}

fn run(board: &mut Board) -> anyhow::Result<()> {
    log::info!("Initializing");
    board.blink(boards::STARTUP_BLINK);

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let setting = Setting::load(config_path.as_deref())?;
    log::info!("Accepted hosts: {:?}", setting.accepted_hosts);

    let device_ip = board.start_ap(&setting)?;
    log::info!("Running with IP {}", device_ip);

    let root = DiskRoot::new(&setting.web_root);
    let mut reactor = Reactor::bind(&setting, device_ip, root)?;
    reactor.run()
}
