#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![warn(clippy::restriction)]

fn main() -> anyhow::Result<()> {
    shield_alert::run()
}
