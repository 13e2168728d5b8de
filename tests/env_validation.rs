use std::process::Command;

#[test]
fn fails_without_database_url() {
    let exe = env!("CARGO_BIN_EXE_devgate");
    let output = Command::new(exe)
        .env_remove("DATABASE_URL")
        .env("JWT_HS_SECRET", "test")
        .env("LOCAL_MODE", "true")
        .output()
        .expect("failed to run devgate binary");
    assert!(!output.status.success());
}

#[test]
fn fails_without_any_jwt_verifier() {
    let exe = env!("CARGO_BIN_EXE_devgate");
    let output = Command::new(exe)
        .env("DATABASE_URL", "postgres://localhost/devgate")
        .env("LOCAL_MODE", "true")
        .env_remove("JWKS_URL")
        .env_remove("JWT_HS_SECRET")
        .output()
        .expect("failed to run devgate binary");
    assert!(!output.status.success());
}

#[test]
fn remote_mode_requires_machines_token() {
    let exe = env!("CARGO_BIN_EXE_devgate");
    let output = Command::new(exe)
        .env("DATABASE_URL", "postgres://localhost/devgate")
        .env("JWT_HS_SECRET", "test")
        .env_remove("LOCAL_MODE")
        .env_remove("MACHINES_API_TOKEN")
        .output()
        .expect("failed to run devgate binary");
    assert!(!output.status.success());
}
