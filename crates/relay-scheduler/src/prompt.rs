/// Inputs to the system prompt. The same inputs must yield byte-identical
/// prompts across restarts, so every collection is sorted before rendering
/// and nothing time- or random-dependent is included.
#[derive(Debug, Clone, Default)]
pub struct SystemPromptInputs {
    pub agent_id: String,
    pub identity: String,
    pub bootstrap_files: Vec<(String, String)>,
    pub skills: Vec<String>,
    pub host: String,
    pub channel: String,
    pub timezone: String,
    pub tool_names: Vec<String>,
    pub sandboxed: bool,
}

const SKILLS_MARKER: &str = "## Available Skills";
const RUNTIME_MARKER: &str = "## Runtime";

pub fn build_system_prompt(inputs: &SystemPromptInputs) -> String {
    let mut prompt = String::new();

    if !inputs.identity.trim().is_empty() {
        prompt.push_str(inputs.identity.trim());
    } else {
        prompt.push_str(&format!("You are agent \"{}\".", inputs.agent_id));
    }

    let mut bootstrap = inputs.bootstrap_files.clone();
    bootstrap.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, content) in &bootstrap {
        if content.trim().is_empty() {
            continue;
        }
        prompt.push_str(&format!("\n\n## {}\n{}", name, content.trim()));
    }

    let mut skills = inputs.skills.clone();
    skills.sort();
    skills.dedup();
    if !skills.is_empty() {
        prompt.push_str(&format!("\n\n{SKILLS_MARKER}\n"));
        for skill in &skills {
            prompt.push_str(&format!("- {skill}\n"));
        }
    }

    prompt.push_str(&format!("\n\n{RUNTIME_MARKER}\n"));
    prompt.push_str(&format!("host: {}\n", inputs.host));
    prompt.push_str(&format!("channel: {}\n", inputs.channel));
    prompt.push_str(&format!("timezone: {}\n", inputs.timezone));
    let mut tools = inputs.tool_names.clone();
    tools.sort();
    tools.dedup();
    prompt.push_str(&format!("tools: {}\n", tools.join(", ")));
    prompt.push_str(&format!(
        "sandbox: {}\n",
        if inputs.sandboxed { "enabled" } else { "disabled" }
    ));

    prompt
}
