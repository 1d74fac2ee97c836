//! Scripted stand-in for the external detection/ReID pipeline.
//!
//! The script speaks the same stdout protocol as the real pipeline. When run
//! as `sh -c <script> <command> <args..>`, `$0` is the command name.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

pub struct FakePipeline {
    stems: Vec<String>,
    label: String,
    fail_flag: Option<(PathBuf, String)>,
    reid_fail_flag: Option<PathBuf>,
    detection_delay: Option<u32>,
    run_log: Option<PathBuf>,
}

impl FakePipeline {
    /// A pipeline that finds one `label` animal in each of `stems`.
    pub fn new(stems: &[&str], label: &str) -> Self {
        Self {
            stems: stems.iter().map(|s| s.to_string()).collect(),
            label: label.to_string(),
            fail_flag: None,
            reid_fail_flag: None,
            detection_delay: None,
            run_log: None,
        }
    }

    /// Detection batches mentioning `stem` fail while `flag` exists.
    pub fn failing_on(mut self, stem: &str, flag: &Path) -> Self {
        self.fail_flag = Some((flag.to_path_buf(), stem.to_string()));
        self
    }

    /// `reid_v2` fails while `flag` exists.
    pub fn failing_reid(mut self, flag: &Path) -> Self {
        self.reid_fail_flag = Some(flag.to_path_buf());
        self
    }

    /// Appends each command name to `log` as it runs.
    pub fn logging_runs(mut self, log: &Path) -> Self {
        self.run_log = Some(log.to_path_buf());
        self
    }

    /// Detection hangs for `seconds` before writing results.
    pub fn slow_detection(mut self, seconds: u32) -> Self {
        self.detection_delay = Some(seconds);
        self
    }

    pub fn script(&self) -> String {
        let fail = match &self.fail_flag {
            Some((flag, stem)) => format!(
                "if [ -f '{}' ] && grep -q '{}' \"$1\"; then echo 'model weights missing' >&2; exit 1; fi\n",
                flag.display(),
                stem
            ),
            None => String::new(),
        };
        let reid_fail = match &self.reid_fail_flag {
            Some(flag) => format!(
                "if [ -f '{}' ]; then echo 'embedding model unavailable' >&2; exit 1; fi\n",
                flag.display()
            ),
            None => String::new(),
        };
        let run_log = match &self.run_log {
            Some(log) => format!("echo \"$0\" >> '{}'\n", log.display()),
            None => String::new(),
        };
        let delay = match self.detection_delay {
            Some(seconds) => format!("sleep {}\n", seconds),
            None => String::new(),
        };

        let template = r#"__LOG__case "$0" in
detection)
echo 'STATUS: BEGIN'
__FAIL____DELAY__done_count=0
for stem in __STEMS__; do
  if grep -q "$stem" "$1"; then
    printf '{"image":"%s.jpg","boxes":[{"label":"__LABEL__","pred_conf":0.93,"detection_conf":0.88,"bbox":[4,4,40,30],"source":"DINO"}]}' "$stem" > "$3/$stem.json"
    done_count=$((done_count + 1))
    echo "PROCESS: $done_count/$done_count"
  fi
done
echo 'STATUS: DONE'
;;
reid_v2)
echo 'STATUS: BEGIN'
__REID_FAIL__if grep '"detection_id"' "$1" >/dev/null && ! grep -q '"image_path"' "$1"; then
  echo 'reid_v2 input lacks image_path' >&2
  exit 1
fi
echo 'STATUS: PROCESSING'
ids=$(grep '"detection_id"' "$1" | tr -dc '0-9\n' | paste -sd, -)
printf '{"individuals":[{"name":"ID-0","detection_ids":[%s]}]}' "$ids" > "$(dirname "$1")/reid_output.json"
echo 'STATUS: DONE'
;;
*)
echo "unknown command $0" >&2
exit 2
;;
esac
"#;
        template
            .replace("__LOG__", &run_log)
            .replace("__REID_FAIL__", &reid_fail)
            .replace("__FAIL__", &fail)
            .replace("__DELAY__", &delay)
            .replace("__STEMS__", &self.stems.join(" "))
            .replace("__LABEL__", &self.label)
    }
}
