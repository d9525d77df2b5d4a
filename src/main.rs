fn main() -> anyhow::Result<()> {
    serial_term_lib::run()
}
