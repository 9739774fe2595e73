fn main() -> anyhow::Result<()> {
    // Load .env file for the Gemini API key
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[ENV] Could not load .env: {}", e);
    }
    env_logger::init();

    landmark_guide_lib::run()
}
