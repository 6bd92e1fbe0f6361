fn main() -> anyhow::Result<()> {
    subframe_guard::cli_main::main()
}
