#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use www_backup_lib::archive::BackupType;
use www_backup_lib::backends::{CompressionConfig, DatabaseDumper, DumpError};
use www_backup_lib::config::EffectiveConfig;
use www_backup_lib::environment::{
    EnvironmentDescriptor, OsFamily, PackageManager, ServiceManagerKind,
};
use www_backup_lib::report::{Progress, Reporter};
use www_backup_lib::services::{ServiceControlError, ServiceManager};
use www_backup_lib::util::retention::RetentionPolicy;
use www_backup_lib::util::signal::CancelToken;

pub const DUMP: &str = "-- MySQL dump 10.13  Distrib 8.0.36\n-- Host: localhost    Database: shop\nCREATE TABLE orders (id INT);\n";

/// Services in memory, optionally cancelling the run once one is stopped.
#[derive(Default)]
pub struct Services {
    pub running: Mutex<HashSet<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub started: Mutex<Vec<String>>,
    pub cancel_on_stop: Option<CancelToken>,
}

impl Services {
    pub fn running(names: &[&str]) -> Self {
        Self {
            running: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.lock().unwrap().contains(name)
    }
}

impl ServiceManager for Services {
    fn is_active(&self, service: &str) -> Result<bool, ServiceControlError> {
        Ok(self.is_running(service))
    }

    fn stop(&self, service: &str) -> Result<(), ServiceControlError> {
        self.running.lock().unwrap().remove(service);
        self.stopped.lock().unwrap().push(service.to_string());
        if let Some(cancel) = &self.cancel_on_stop {
            cancel.cancel();
        }
        Ok(())
    }

    fn start(&self, service: &str) -> Result<(), ServiceControlError> {
        self.running.lock().unwrap().insert(service.to_string());
        self.started.lock().unwrap().push(service.to_string());
        Ok(())
    }
}

/// Database holding a fixed dump, recording what was imported.
#[derive(Default)]
pub struct Database {
    pub imported: Mutex<Option<Vec<u8>>>,
}

impl DatabaseDumper for Database {
    fn database(&self) -> &str {
        "shop"
    }

    fn dump(&self, out: &mut dyn Write) -> Result<(), DumpError> {
        out.write_all(DUMP.as_bytes())?;
        Ok(())
    }

    fn import(&self, input: &mut dyn Read) -> Result<(), DumpError> {
        let mut sql = Vec::new();
        input.read_to_end(&mut sql)?;
        *self.imported.lock().unwrap() = Some(sql);
        Ok(())
    }
}

#[derive(Default)]
pub struct Messages(pub Mutex<Vec<String>>);

impl Messages {
    pub fn last(&self) -> Option<String> {
        self.0.lock().unwrap().last().cloned()
    }
}

impl Reporter for Messages {
    fn info(&self, message: &str) {
        self.0.lock().unwrap().push(format!("INFO {message}"));
    }

    fn warn(&self, message: &str) {
        self.0.lock().unwrap().push(format!("WARNING {message}"));
    }

    fn error(&self, message: &str) {
        self.0.lock().unwrap().push(format!("ERROR {message}"));
    }

    fn success(&self, message: &str) {
        self.0.lock().unwrap().push(format!("SUCCESS {message}"));
    }

    fn progress(&self, _progress: Progress) {}
}

pub fn debian() -> EnvironmentDescriptor {
    EnvironmentDescriptor {
        os_family: OsFamily::Linux,
        distro: "debian".into(),
        distro_like: String::new(),
        package_manager: PackageManager::Apt,
        service_manager: ServiceManagerKind::Systemd,
        default_web_root: "/var/www/html".into(),
    }
}

/// A small site next to an empty backup destination.
pub struct Host {
    _dir: tempfile::TempDir,
    pub www: PathBuf,
    pub destination: PathBuf,
}

impl Host {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let www = dir.path().join("www");
        let destination = dir.path().join("backups");
        fs::create_dir_all(www.join("wp-content/uploads/2026")).unwrap();
        fs::create_dir_all(&destination).unwrap();
        fs::write(www.join("index.php"), b"<?php define('WP_USE_THEMES', true);").unwrap();
        fs::write(www.join("wp-config.php"), b"<?php $table_prefix = 'wp_';").unwrap();
        fs::write(www.join("error.log"), b"PHP Warning: deprecated").unwrap();
        fs::write(www.join("wp-content/uploads/2026/cat.jpg"), vec![0xd8; 10_000]).unwrap();

        Self {
            _dir: dir,
            www,
            destination,
        }
    }

    pub fn config(&self) -> EffectiveConfig {
        EffectiveConfig {
            www_source_path: self.www.clone(),
            database: None,
            destination_path: self.destination.clone(),
            backup_type: BackupType::Full,
            compression: CompressionConfig::default(),
            exclusion_patterns: vec!["*.log".into()],
            retention: RetentionPolicy {
                max_age_days: None,
                max_count: Some(3),
            },
            services: Some(vec!["nginx".into(), "apache2".into(), "php-fpm".into()]),
            notify_command: None,
            log_file: None,
            dry_run: false,
            automatic_mode: true,
            quiet: true,
        }
    }

    /// Relative paths and contents of every file of the web root.
    pub fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        collect(&self.www, &self.www, &mut files);
        files.sort();
        files
    }
}

fn collect(root: &Path, dir: &Path, files: &mut Vec<(String, Vec<u8>)>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect(root, &path, files);
        } else {
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            files.push((rel, fs::read(&path).unwrap()));
        }
    }
}
