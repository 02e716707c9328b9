use anyhow::Result;

fn main() -> Result<()> {
    hostbox::cli::run()
}
