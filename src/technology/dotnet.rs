use super::{Technology, Workspace};

pub(super) const KEY: &str = "dotnet";
pub(super) const DEFAULT_IMAGE: &str = "codecell/dotnet";

const PROJECT_FILE: &str = "Runner.csproj";
const PROGRAM_FILE: &str = "Program.cs";

const PROJECT_CONTENTS: &str = r#"<Project Sdk="Microsoft.NET.Sdk">
  <PropertyGroup>
    <OutputType>Exe</OutputType>
    <TargetFramework>net10.0</TargetFramework>
    <ImplicitUsings>enable</ImplicitUsings>
    <Nullable>enable</Nullable>
  </PropertyGroup>
</Project>
"#;

/// .NET console application built and run with `dotnet run`.
#[derive(Debug, Clone)]
pub(crate) struct DotNetTechnology {
    image: String,
}

impl DotNetTechnology {
    pub fn new(image: String) -> Self {
        Self { image }
    }
}

impl Technology for DotNetTechnology {
    fn key(&self) -> &str {
        KEY
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn command(&self) -> Vec<String> {
        vec!["dotnet".to_string(), "run".to_string()]
    }

    fn materialize(&self, workspace: &mut Workspace, source_code: &str) {
        workspace.write(PROJECT_FILE, PROJECT_CONTENTS);
        workspace.write(PROGRAM_FILE, source_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_writes_project_and_program() {
        let technology = DotNetTechnology::new(DEFAULT_IMAGE.to_string());
        let mut workspace = Workspace::new();
        technology.materialize(&mut workspace, "Console.WriteLine(2 + 2);");

        assert_eq!(workspace.len(), 2);
        assert_eq!(
            workspace.file(PROGRAM_FILE),
            Some(b"Console.WriteLine(2 + 2);".as_slice())
        );
        let project = std::str::from_utf8(workspace.file(PROJECT_FILE).unwrap()).unwrap();
        assert!(project.contains("<OutputType>Exe</OutputType>"));
    }
}
