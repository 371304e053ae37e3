use spotstack_config::LoadedSettings;

pub fn handle(loaded: &LoadedSettings) -> anyhow::Result<()> {
    println!("# source: {}", loaded.origin());
    print!("{}", serde_yaml::to_string(&loaded.settings)?);
    Ok(())
}
